//! Fault injection for executions submitted with the fault flag set.
//!
//! The engine asks a [`FaultSource`] once per step. Implementations are
//! deterministic: the same execution id and step order always give the
//! same answer.

use std::collections::HashMap;

use ptexec_core::types::FaultType;

pub trait FaultSource: Send + Sync {
    fn fault_for(&self, execution_id: &str, step_order: u32) -> Option<FaultType>;
}

/// Never injects.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultSource for NoFaults {
    fn fault_for(&self, _execution_id: &str, _step_order: u32) -> Option<FaultType> {
        None
    }
}

/// Fixed step-order to fault map applied to every execution.
#[derive(Debug, Default, Clone)]
pub struct ScriptedFaults {
    by_order: HashMap<u32, FaultType>,
}

impl ScriptedFaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn at(mut self, step_order: u32, fault: FaultType) -> Self {
        self.by_order.insert(step_order, fault);
        self
    }
}

impl FaultSource for ScriptedFaults {
    fn fault_for(&self, _execution_id: &str, step_order: u32) -> Option<FaultType> {
        self.by_order.get(&step_order).copied()
    }
}

/// Marks roughly `rate` of all steps as faulty, chosen by a stable hash of
/// the execution id and step order.
#[derive(Debug, Clone, Copy)]
pub struct HashedFaults {
    rate: f64,
}

const BUCKETS: u64 = 10_000;

impl HashedFaults {
    pub fn new(rate: f64) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        Self { rate }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// 64-bit FNV-1a with a splitmix64 finalizer so the low bits are usable.
fn stable_hash(parts: &[&[u8]]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in *part {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash = (hash ^ (hash >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash = (hash ^ (hash >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    hash ^ (hash >> 31)
}

impl FaultSource for HashedFaults {
    fn fault_for(&self, execution_id: &str, step_order: u32) -> Option<FaultType> {
        let hash = stable_hash(&[execution_id.as_bytes(), b":", &step_order.to_le_bytes()]);
        let threshold = (self.rate * BUCKETS as f64).round() as u64;
        if hash % BUCKETS >= threshold {
            return None;
        }
        let pick = (hash >> 32) as usize % FaultType::ALL.len();
        Some(FaultType::ALL[pick])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_faults_apply_by_order() {
        let faults = ScriptedFaults::new().at(3, FaultType::Timeout);
        assert_eq!(faults.fault_for("any", 3), Some(FaultType::Timeout));
        assert_eq!(faults.fault_for("any", 2), None);
    }

    #[test]
    fn hashed_faults_are_deterministic() {
        let faults = HashedFaults::new(0.5);
        for order in 1..50 {
            assert_eq!(faults.fault_for("exec-1", order), faults.fault_for("exec-1", order));
        }
    }

    #[test]
    fn hashed_rate_bounds() {
        let never = HashedFaults::new(0.0);
        let always = HashedFaults::new(1.0);
        for order in 1..200 {
            assert_eq!(never.fault_for("e", order), None);
            assert!(always.fault_for("e", order).is_some());
        }
        assert_eq!(HashedFaults::new(f64::NAN).rate(), 0.0);
        assert_eq!(HashedFaults::new(7.0).rate(), 1.0);
    }

    #[test]
    fn hashed_rate_is_roughly_honoured() {
        let faults = HashedFaults::new(0.2);
        let hits = (0..200)
            .flat_map(|e| (1..=10).map(move |o| (e, o)))
            .filter(|(e, o)| faults.fault_for(&format!("exec-{e}"), *o).is_some())
            .count();
        // 2000 samples at 20%.
        assert!((250..=550).contains(&hits), "hits = {hits}");
    }
}
