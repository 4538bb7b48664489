//! Error types for the core domain model.

use thiserror::Error;

use crate::types::ExecutionStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("illegal status transition {from} -> {to}")]
    IllegalTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("cannot append step while execution is {status}")]
    NotRunning { status: ExecutionStatus },
}
