use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

// ─── Execution status ─────────────────────────────────────────────

/// Lifecycle status of one execution.
///
/// Forward-only: `Queued -> Running -> {Passed | Failed | Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [Self; 5] = [
        Self::Queued,
        Self::Running,
        Self::Passed,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal edge of the status machine.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Running, Self::Passed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::UnknownVariant {
                kind: "execution status",
                value: s.to_string(),
            })
    }
}

// ─── Step verdicts ────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    #[default]
    Pass,
    Fail,
    Inconclusive,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Inconclusive => "INCONCLUSIVE",
        }
    }
}

impl FromStr for Verdict {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PASS" | "PASSED" => Ok(Self::Pass),
            "FAIL" | "FAILED" => Ok(Self::Fail),
            "INCONCLUSIVE" => Ok(Self::Inconclusive),
            _ => Err(ParseError::UnknownVariant {
                kind: "verdict",
                value: s.to_string(),
            }),
        }
    }
}

/// Fault classes a step can be marked with when fault injection is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultType {
    Timeout,
    MalformedMessage,
    UnexpectedMessage,
    MissingIe,
    ProtocolViolation,
}

impl FaultType {
    pub const ALL: [Self; 5] = [
        Self::Timeout,
        Self::MalformedMessage,
        Self::UnexpectedMessage,
        Self::MissingIe,
        Self::ProtocolViolation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::MalformedMessage => "malformed_message",
            Self::UnexpectedMessage => "unexpected_message",
            Self::MissingIe => "missing_ie",
            Self::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for FaultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message direction relative to the device under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Uplink: device to network.
    Ul,
    /// Downlink: network to device.
    Dl,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ul => "UL",
            Self::Dl => "DL",
        }
    }
}

impl FromStr for Direction {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UL" | "UPLINK" => Ok(Self::Ul),
            "DL" | "DOWNLINK" => Ok(Self::Dl),
            _ => Err(ParseError::UnknownVariant {
                kind: "direction",
                value: s.to_string(),
            }),
        }
    }
}

// ─── Steps ────────────────────────────────────────────────────────

/// A step before it is appended to an execution: descriptors plus verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    pub layer: String,
    pub direction: Direction,
    pub message_type: String,
    #[serde(default)]
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_type: Option<FaultType>,
}

impl StepSpec {
    pub fn new(layer: impl Into<String>, direction: Direction, message_type: impl Into<String>) -> Self {
        Self {
            layer: layer.into(),
            direction,
            message_type: message_type.into(),
            verdict: Verdict::Pass,
            fault_type: None,
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = verdict;
        self
    }

    /// Mark the step as failed by an injected fault.
    pub fn with_fault(mut self, fault: FaultType) -> Self {
        self.verdict = Verdict::Fail;
        self.fault_type = Some(fault);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub execution_id: String,
    /// 1-based, strictly increasing within an execution.
    pub step_order: u32,
    pub layer: String,
    pub direction: Direction,
    pub message_type: String,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_type: Option<FaultType>,
    pub timestamp: DateTime<Utc>,
}

/// Progress block carried by every `execution_step` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u32,
    pub total: u32,
    pub percentage: u32,
}

impl Progress {
    /// `percentage = round(current / total * 100)`; zero when `total` is zero.
    pub fn new(current: u32, total: u32) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            (f64::from(current) / f64::from(total) * 100.0).round() as u32
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// Aggregate computed once an execution reaches PASSED or FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub total_steps: u32,
    pub passed_steps: u32,
    pub failed_steps: u32,
    pub inconclusive_steps: u32,
    /// Percentage of PASS steps, rounded to the nearest integer.
    pub success_rate: u32,
    pub duration_ms: i64,
    /// Distinct layers in first-seen order.
    pub layers: Vec<String>,
    /// Distinct message types in first-seen order.
    pub message_types: Vec<String>,
}

// ─── Source routing ───────────────────────────────────────────────

/// Backing data source kinds, in descending confidence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Real,
    Cached,
    Mock,
}

impl SourceType {
    pub const ALL: [Self; 3] = [Self::Real, Self::Cached, Self::Mock];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Cached => "cached",
            Self::Mock => "mock",
        }
    }

    /// Next source to try after `self` returned nothing.
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Real => Some(Self::Cached),
            Self::Cached => Some(Self::Mock),
            Self::Mock => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseError::UnknownVariant {
                kind: "source type",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingDecision {
    pub tool: String,
    pub request_kind: String,
    pub source: SourceType,
    /// Always within `[0, 1]`.
    pub confidence: f64,
    pub reasoning: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverEvent {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    pub failed_source: SourceType,
    pub reason: String,
}

// ─── Merged records ───────────────────────────────────────────────

fn default_level() -> String {
    "info".to_string()
}

/// A record as submitted by a producer, before the merger stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub source: String,
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RecordDraft {
    pub fn new(source: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            level: default_level(),
            payload,
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    /// Arrival sequence assigned by the merger.
    pub seq: u64,
    pub source: String,
    pub level: String,
    /// Arrival time; non-decreasing in `seq` order.
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_case() {
        let json = serde_json::to_string(&ExecutionStatus::Cancelled).expect("serialize");
        assert_eq!(json, "\"CANCELLED\"");
        let back: ExecutionStatus = serde_json::from_str("\"RUNNING\"").expect("deserialize");
        assert_eq!(back, ExecutionStatus::Running);
    }

    #[test]
    fn status_edges_are_forward_only() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Passed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Queued.can_transition_to(Passed));
        assert!(!Queued.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Queued));
        for terminal in [Passed, Failed, Cancelled] {
            for next in ExecutionStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("passed".parse::<ExecutionStatus>().expect("parse"), ExecutionStatus::Passed);
        assert!("done".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn progress_percentage_rounds() {
        assert_eq!(Progress::new(1, 3).percentage, 33);
        assert_eq!(Progress::new(2, 3).percentage, 67);
        assert_eq!(Progress::new(5, 5).percentage, 100);
        assert_eq!(Progress::new(0, 0).percentage, 0);
    }

    #[test]
    fn source_fallback_chain_ends_at_mock() {
        assert_eq!(SourceType::Real.fallback(), Some(SourceType::Cached));
        assert_eq!(SourceType::Cached.fallback(), Some(SourceType::Mock));
        assert_eq!(SourceType::Mock.fallback(), None);
    }

    #[test]
    fn step_spec_wire_format_is_camel_case() {
        let spec = StepSpec::new("RRC", Direction::Dl, "RRCSetup").with_fault(FaultType::MissingIe);
        let json = serde_json::to_value(&spec).expect("serialize");
        assert_eq!(json["messageType"], "RRCSetup");
        assert_eq!(json["direction"], "DL");
        assert_eq!(json["verdict"], "FAIL");
        assert_eq!(json["faultType"], "missing_ie");
    }

    #[test]
    fn record_draft_defaults_level() {
        let draft: RecordDraft =
            serde_json::from_str(r#"{"source":"sniffer-a","payload":{"msg":"Attach"}}"#)
                .expect("deserialize");
        assert_eq!(draft.level, "info");
        assert_eq!(draft.payload["msg"], "Attach");
    }
}
