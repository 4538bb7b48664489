//! Component wiring for `ptexecd`.
//!
//! [`Daemon::new`] builds every shared table from a [`DaemonConfig`];
//! [`Daemon::start`] binds both listeners and spawns the long-lived tasks.
//! All tasks stop when the cancellation token fires.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ptexec_gateway::merger::{StreamMerger, Subscription};
use ptexec_gateway::router::SourceRouter;
use ptexec_gateway::sources::{LiveSource, SnapshotCache, SyntheticSource};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonConfig;
use crate::engine::{EngineConfig, ExecutionEngine};
use crate::faults::HashedFaults;
use crate::ingest::IngestListener;
use crate::planner::DefaultPlanner;
use crate::publisher::EventPublisher;
use crate::registry::{ConnectionRegistry, run_liveness};
use crate::ws_server::WsServer;

pub struct Daemon {
    config: DaemonConfig,
    cancel: CancellationToken,
    registry: Arc<ConnectionRegistry>,
    merger: Arc<StreamMerger>,
    router: Arc<SourceRouter>,
    engine: ExecutionEngine,
    record_fanout: Subscription,
}

impl Daemon {
    pub fn new(config: DaemonConfig, cancel: CancellationToken) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let publisher = EventPublisher::new(Arc::clone(&registry));

        let merger = Arc::new(StreamMerger::new(config.merge_buffer_capacity));
        let fanout = publisher.clone();
        let record_fanout = merger.subscribe(move |record| {
            fanout.publish_record(record);
        });

        let live = Arc::new(LiveSource::new(Arc::clone(&merger), config.live_freshness()));
        let router = Arc::new(SourceRouter::new(
            config.router_config(),
            Arc::clone(&live) as _,
            live,
            Arc::new(SnapshotCache::new(config.snapshot_max_age())),
            Arc::new(SyntheticSource),
        ));

        let planner = DefaultPlanner::new(config.default_step_count).with_router(Arc::clone(&router));
        let engine = ExecutionEngine::new(
            EngineConfig {
                step_delay: config.step_delay(),
                stats_window: config.stats_window(),
                retention: config.execution_retention,
            },
            publisher,
            Arc::new(planner),
            Arc::new(HashedFaults::new(config.fault_rate)),
        );

        Self {
            config,
            cancel,
            registry,
            merger,
            router,
            engine,
            record_fanout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn merger(&self) -> &Arc<StreamMerger> {
        &self.merger
    }

    pub fn router(&self) -> &Arc<SourceRouter> {
        &self.router
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// Bind the channel and ingest listeners, then spawn the server, ingest,
    /// liveness and routing-refresh tasks.
    pub async fn start(self) -> std::io::Result<RunningDaemon> {
        let ws = WsServer::new(
            self.config.listen_addr,
            Arc::clone(&self.registry),
            self.engine.clone(),
            self.cancel.clone(),
        )
        .with_max_connections(self.config.max_connections)
        .with_queue_capacity(self.config.channel_queue_capacity)
        .with_allowed_origins(self.config.allowed_origins.clone());
        let (ws_listener, ws_addr) = ws.bind().await?;

        let ingest = IngestListener::new(
            self.config.ingest_addr,
            Arc::clone(&self.merger),
            self.cancel.clone(),
        );
        let (ingest_listener, ingest_addr) = ingest.bind().await?;

        let tasks = vec![
            tokio::spawn(async move {
                if let Err(e) = ws.serve(ws_listener).await {
                    tracing::error!(error = %e, "ws server stopped with error");
                }
            }),
            tokio::spawn(async move {
                if let Err(e) = ingest.serve(ingest_listener).await {
                    tracing::error!(error = %e, "ingest stopped with error");
                }
            }),
            tokio::spawn(run_liveness(
                Arc::clone(&self.registry),
                self.config.liveness_interval(),
                self.cancel.clone(),
            )),
            tokio::spawn(run_routing_refresh(
                Arc::clone(&self.router),
                self.config.routing_refresh_interval(),
                self.cancel.clone(),
            )),
        ];

        tracing::info!(ws = %ws_addr, ingest = %ingest_addr, "ptexec daemon started");
        Ok(RunningDaemon {
            ws_addr,
            ingest_addr,
            daemon: self,
            tasks,
        })
    }
}

pub struct RunningDaemon {
    pub ws_addr: SocketAddr,
    pub ingest_addr: SocketAddr,
    daemon: Daemon,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningDaemon {
    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(self) {
        self.daemon.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "daemon task ended abnormally");
            }
        }
        self.daemon.record_fanout.unsubscribe();
        tracing::info!("ptexec daemon stopped");
    }
}

/// Re-probe every known tool every `period` until cancelled.
pub async fn run_routing_refresh(
    router: Arc<SourceRouter>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let probed = router.refresh_health();
                tracing::debug!(probed, "routing health refreshed");
            }
            _ = cancel.cancelled() => {
                tracing::debug!("routing refresh stopped");
                break;
            }
        }
    }
}
