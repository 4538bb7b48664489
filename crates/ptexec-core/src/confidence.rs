//! Routing confidence model.
//!
//! Each (tool, source) pair keeps an exponentially decayed success ratio in
//! `[0, 1]`. The ratio is mapped into a band reserved for the source type so
//! that any real decision outranks any cached one, which outranks any mock.

use serde::{Deserialize, Serialize};

use crate::types::SourceType;

/// Weight given to the newest outcome.
pub const DEFAULT_DECAY_ALPHA: f64 = 0.2;

/// `(floor, width)` of each source's confidence band.
fn band(source: SourceType) -> (f64, f64) {
    match source {
        SourceType::Real => (0.70, 0.30),
        SourceType::Cached => (0.40, 0.29),
        SourceType::Mock => (0.10, 0.29),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessRatio {
    value: f64,
    alpha: f64,
}

impl SuccessRatio {
    /// Starts optimistic at 1.0 so an unseen source is not penalised.
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 1.0,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn record(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.value = (self.alpha * outcome + (1.0 - self.alpha) * self.value).clamp(0.0, 1.0);
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// Confidence for a decision that routes to `source`.
    pub fn confidence(&self, source: SourceType) -> f64 {
        confidence_for(source, self.value)
    }
}

impl Default for SuccessRatio {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_ALPHA)
    }
}

/// Map a success ratio onto the band for `source`. Result is within `[0, 1]`.
pub fn confidence_for(source: SourceType, ratio: f64) -> f64 {
    let (floor, width) = band(source);
    let ratio = if ratio.is_finite() { ratio.clamp(0.0, 1.0) } else { 0.0 };
    floor + width * ratio
}
