//! Channel wire protocol: JSON text frames tagged by `type`.

use chrono::{DateTime, Utc};
use ptexec_core::types::{ExecutionStatus, ExecutionSummary, MergedRecord, Progress, Step};
use serde::{Deserialize, Serialize};

use crate::error::InboundError;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Every execution event, regardless of owner.
pub const EXECUTIONS_TOPIC: &str = "executions";
/// Every merged record.
pub const RECORDS_TOPIC: &str = "records";

/// Events for a single execution.
pub fn execution_topic(execution_id: &str) -> String {
    format!("execution:{execution_id}")
}

/// Records from a single producer.
pub fn records_topic(source: &str) -> String {
    format!("records:{source}")
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Authenticate {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    Ping,
    /// Submit an execution owned by the authenticated user.
    StartExecution {
        test_case_id: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default)]
        fault_injection: bool,
    },
    CancelExecution {
        execution_id: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, InboundError> {
        Ok(serde_json::from_str(text)?)
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    ConnectionEstablished {
        connection_id: String,
        timestamp: DateTime<Utc>,
    },
    AuthenticationSuccess {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    SubscriptionSuccess {
        channel: String,
    },
    UnsubscriptionSuccess {
        channel: String,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    ExecutionQueued {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        status: ExecutionStatus,
    },
    ExecutionStarted {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        status: ExecutionStatus,
    },
    ExecutionStep {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        step: Step,
        progress: Progress,
    },
    ExecutionCompleted {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        status: ExecutionStatus,
        summary: ExecutionSummary,
    },
    ExecutionFailed {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        status: ExecutionStatus,
        error: String,
    },
    ExecutionCancelled {
        execution_id: String,
        test_case_id: String,
        timestamp: DateTime<Utc>,
        status: ExecutionStatus,
    },
    Record {
        record: MergedRecord,
    },
}

impl ServerMessage {
    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::AuthenticationSuccess { .. } => "authentication_success",
            Self::SubscriptionSuccess { .. } => "subscription_success",
            Self::UnsubscriptionSuccess { .. } => "unsubscription_success",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
            Self::ExecutionQueued { .. } => "execution_queued",
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionStep { .. } => "execution_step",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::ExecutionCancelled { .. } => "execution_cancelled",
            Self::Record { .. } => "record",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// What a channel's writer task is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Liveness probe (WebSocket ping).
    Probe,
    /// Close the transport.
    Close,
}
