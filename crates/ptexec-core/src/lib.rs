//! ptexec-core: domain model for protocol test executions.
//!
//! Pure library: execution/step records and their status machine, routing
//! and merged-record types, the real-source health machine, and the
//! routing confidence model. No IO, no async runtime.

pub mod confidence;
pub mod error;
pub mod execution;
pub mod health;
pub mod types;

pub use confidence::{SuccessRatio, confidence_for};
pub use error::{ParseError, TransitionError};
pub use execution::Execution;
pub use health::{HealthPolicy, ProbeSignal, SourceHealth, SourceHealthState};
pub use types::{
    Direction, ExecutionStatus, ExecutionSummary, FailoverEvent, FaultType, MergedRecord,
    Progress, RecordDraft, RoutingDecision, SourceType, Step, StepSpec, Verdict,
};
