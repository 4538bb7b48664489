use ptexec_core::TransitionError;

/// Faults raised while planning or driving one execution. Never returned to
/// the submitter: the engine turns them into status `FAILED` plus an
/// `execution_failed` event.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("step plan failed: {0}")]
    Plan(String),
    #[error("step {order} failed: {message}")]
    Step { order: u32, message: String },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("execution task panicked: {0}")]
    Panicked(String),
    #[error("execution task aborted")]
    Aborted,
}

/// A malformed inbound channel frame. Logged and answered with an `error`
/// frame; the channel stays open.
#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("binary frames are not supported")]
    Binary,
}
