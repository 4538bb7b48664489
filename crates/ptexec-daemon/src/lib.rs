//! ptexec daemon: channel registry and fan-out, the execution engine, record
//! ingest, and the WebSocket endpoint that ties them to clients.

pub mod app;
pub mod config;
pub mod engine;
pub mod error;
pub mod faults;
pub mod ingest;
pub mod planner;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod ws_server;

pub use app::{Daemon, RunningDaemon};
pub use config::{ConfigError, DaemonConfig};
pub use engine::{ExecutionEngine, ExecutionRequest, ExecutionStats};
pub use publisher::EventPublisher;
pub use registry::{ChannelId, ConnectionRegistry};
