//! Execution record and its forward-only status machine.
//!
//! An [`Execution`] is mutated only by the task that owns it. Steps are
//! append-only and numbered 1..N; once a terminal status is reached the
//! record no longer accepts steps or transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransitionError;
use crate::types::{ExecutionStatus, ExecutionSummary, Step, StepSpec, Verdict};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub test_case_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub fault_injection: bool,
    #[serde(default)]
    pub params: serde_json::Value,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ExecutionSummary>,
    /// Error message when the execution failed on a fault rather than a verdict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    /// Admit a new execution in `QUEUED`.
    pub fn new(
        id: impl Into<String>,
        test_case_id: impl Into<String>,
        user_id: impl Into<String>,
        params: serde_json::Value,
        fault_injection: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            test_case_id: test_case_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Queued,
            started_at: now,
            finished_at: None,
            fault_injection,
            params,
            steps: Vec::new(),
            summary: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping `finished_at` on terminal statuses.
    pub fn transition(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::IllegalTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// Append the next step. Only legal while `RUNNING`.
    pub fn append_step(
        &mut self,
        step_id: impl Into<String>,
        spec: StepSpec,
        now: DateTime<Utc>,
    ) -> Result<&Step, TransitionError> {
        if self.status != ExecutionStatus::Running {
            return Err(TransitionError::NotRunning {
                status: self.status,
            });
        }
        let step_order = u32::try_from(self.steps.len()).unwrap_or(u32::MAX - 1) + 1;
        self.steps.push(Step {
            id: step_id.into(),
            execution_id: self.id.clone(),
            step_order,
            layer: spec.layer,
            direction: spec.direction,
            message_type: spec.message_type,
            verdict: spec.verdict,
            fault_type: spec.fault_type,
            timestamp: now,
        });
        Ok(&self.steps[self.steps.len() - 1])
    }

    /// Terminal status implied by the steps recorded so far.
    pub fn verdict_status(&self) -> ExecutionStatus {
        if self.steps.iter().any(|s| s.verdict == Verdict::Fail) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Passed
        }
    }

    /// Elapsed time from admission to `finished_at` (or `now` if still open).
    pub fn duration_ms(&self, now: DateTime<Utc>) -> i64 {
        let end = self.finished_at.unwrap_or(now);
        end.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0)
    }

    pub fn summarize(&self, now: DateTime<Utc>) -> ExecutionSummary {
        let count = |v: Verdict| {
            u32::try_from(self.steps.iter().filter(|s| s.verdict == v).count()).unwrap_or(u32::MAX)
        };
        let total_steps = u32::try_from(self.steps.len()).unwrap_or(u32::MAX);
        let passed_steps = count(Verdict::Pass);
        let success_rate = if total_steps == 0 {
            0
        } else {
            (f64::from(passed_steps) / f64::from(total_steps) * 100.0).round() as u32
        };

        let mut layers: Vec<String> = Vec::new();
        let mut message_types: Vec<String> = Vec::new();
        for step in &self.steps {
            if !layers.contains(&step.layer) {
                layers.push(step.layer.clone());
            }
            if !message_types.contains(&step.message_type) {
                message_types.push(step.message_type.clone());
            }
        }

        ExecutionSummary {
            total_steps,
            passed_steps,
            failed_steps: count(Verdict::Fail),
            inconclusive_steps: count(Verdict::Inconclusive),
            success_rate,
            duration_ms: self.duration_ms(now),
            layers,
            message_types,
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, FaultType};
    use chrono::Duration;

    fn ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid RFC3339 timestamp")
            .with_timezone(&Utc)
    }

    fn t0() -> DateTime<Utc> {
        ts("2026-03-01T10:00:00Z")
    }

    fn running() -> Execution {
        let mut exec = Execution::new("ex-1", "TC-ATTACH", "alice", serde_json::Value::Null, false, t0());
        exec.transition(ExecutionStatus::Running, t0()).expect("queued -> running");
        exec
    }

    #[test]
    fn new_execution_is_queued() {
        let exec = Execution::new("ex-1", "TC-1", "alice", serde_json::Value::Null, true, t0());
        assert_eq!(exec.status, ExecutionStatus::Queued);
        assert!(exec.fault_injection);
        assert!(exec.steps.is_empty());
        assert!(exec.finished_at.is_none());
    }

    #[test]
    fn cannot_skip_running() {
        let mut exec = Execution::new("ex-1", "TC-1", "alice", serde_json::Value::Null, false, t0());
        let err = exec
            .transition(ExecutionStatus::Passed, t0())
            .expect_err("queued -> passed must be rejected");
        assert_eq!(
            err,
            TransitionError::IllegalTransition {
                from: ExecutionStatus::Queued,
                to: ExecutionStatus::Passed
            }
        );
        assert_eq!(exec.status, ExecutionStatus::Queued);
    }

    #[test]
    fn terminal_transition_stamps_finish_time() {
        let mut exec = running();
        let end = t0() + Duration::milliseconds(2_500);
        exec.transition(ExecutionStatus::Cancelled, end).expect("running -> cancelled");
        assert_eq!(exec.finished_at, Some(end));
        assert_eq!(exec.duration_ms(end + Duration::seconds(60)), 2_500);
        assert!(exec.transition(ExecutionStatus::Failed, end).is_err());
    }

    #[test]
    fn steps_are_numbered_from_one() {
        let mut exec = running();
        for msg in ["RRCSetupRequest", "RRCSetup", "RRCSetupComplete"] {
            exec.append_step(format!("st-{msg}"), StepSpec::new("RRC", Direction::Ul, msg), t0())
                .expect("append while running");
        }
        let orders: Vec<u32> = exec.steps.iter().map(|s| s.step_order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        assert!(exec.steps.iter().all(|s| s.execution_id == "ex-1"));
    }

    #[test]
    fn append_rejected_once_terminal() {
        let mut exec = running();
        exec.transition(ExecutionStatus::Cancelled, t0()).expect("cancel");
        let err = exec
            .append_step("st-x", StepSpec::new("NAS", Direction::Ul, "AttachRequest"), t0())
            .expect_err("append after cancel");
        assert_eq!(
            err,
            TransitionError::NotRunning {
                status: ExecutionStatus::Cancelled
            }
        );
        assert!(exec.steps.is_empty());
    }

    #[test]
    fn one_failed_step_fails_the_execution() {
        let mut exec = running();
        for order in 1..=5 {
            let mut spec = StepSpec::new("NAS", Direction::Dl, format!("Msg{order}"));
            if order == 3 {
                spec = spec.with_fault(FaultType::Timeout);
            }
            exec.append_step(format!("st-{order}"), spec, t0()).expect("append");
        }
        assert_eq!(exec.verdict_status(), ExecutionStatus::Failed);

        let summary = exec.summarize(t0() + Duration::seconds(3));
        assert_eq!(summary.total_steps, 5);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.passed_steps, 4);
        assert_eq!(summary.success_rate, 80);
        assert_eq!(summary.duration_ms, 3_000);
    }

    #[test]
    fn inconclusive_steps_do_not_fail_the_execution() {
        let mut exec = running();
        exec.append_step("a", StepSpec::new("MAC", Direction::Ul, "BSR"), t0()).expect("append");
        exec.append_step(
            "b",
            StepSpec::new("MAC", Direction::Dl, "Grant").with_verdict(Verdict::Inconclusive),
            t0(),
        )
        .expect("append");
        assert_eq!(exec.verdict_status(), ExecutionStatus::Passed);

        let summary = exec.summarize(t0());
        assert_eq!(summary.inconclusive_steps, 1);
        assert_eq!(summary.success_rate, 50);
    }

    #[test]
    fn summary_lists_distinct_layers_in_first_seen_order() {
        let mut exec = running();
        for (layer, msg) in [("RRC", "A"), ("NAS", "B"), ("RRC", "A"), ("PDCP", "C")] {
            exec.append_step(format!("{layer}{msg}"), StepSpec::new(layer, Direction::Ul, msg), t0())
                .expect("append");
        }
        let summary = exec.summarize(t0());
        assert_eq!(summary.layers, vec!["RRC", "NAS", "PDCP"]);
        assert_eq!(summary.message_types, vec!["A", "B", "C"]);
    }

    #[test]
    fn empty_execution_passes_with_zero_rate() {
        let exec = running();
        assert_eq!(exec.verdict_status(), ExecutionStatus::Passed);
        assert_eq!(exec.summarize(t0()).success_rate, 0);
    }
}
