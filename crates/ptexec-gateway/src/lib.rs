//! ptexec-gateway: stream merging and per-request source routing.
//!
//! [`merger::StreamMerger`] folds records from independent producers into one
//! bounded buffer. [`router::SourceRouter`] answers `(tool, kind)` requests
//! from the real, cached or mock source, recording every decision and
//! failover. No async runtime; callers drive both from their own tasks.

pub mod merger;
pub mod router;
pub mod sources;

pub use merger::{MergerStats, StreamMerger, Subscription};
pub use router::{RouteResult, RouterConfig, SourceRouter, ToolRoutingStats};
pub use sources::{DataSource, HealthProbe, LiveSource, SnapshotCache, StaticProbe, SyntheticSource};
