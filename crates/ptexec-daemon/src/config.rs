//! Daemon configuration: TOML file with per-field defaults, overridden by
//! CLI flags in `main`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ptexec_gateway::router::RouterConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Ten years.
const MAX_STATS_WINDOW_HOURS: u32 = 87_600;

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Newline-JSON record ingest address.
    pub ingest_addr: SocketAddr,
    pub max_connections: usize,
    /// Per-channel outbound queue depth. A full queue drops messages.
    pub channel_queue_capacity: usize,
    /// Browser origins accepted in addition to loopback ones.
    pub allowed_origins: Vec<String>,
    pub liveness_interval_ms: u64,
    pub routing_refresh_interval_ms: u64,
    /// Simulated service time between steps.
    pub step_delay_ms: u64,
    pub stats_window_hours: u32,
    pub merge_buffer_capacity: usize,
    pub failover_history_capacity: usize,
    pub decision_history_capacity: usize,
    /// Terminal executions kept before the oldest-finished are evicted.
    pub execution_retention: usize,
    pub live_freshness_secs: u64,
    pub snapshot_max_age_secs: u64,
    pub default_step_count: u32,
    /// Share of steps the hashed fault source marks as faulty, in `[0, 1]`.
    pub fault_rate: f64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            ingest_addr: SocketAddr::from(([127, 0, 0, 1], 8788)),
            max_connections: 256,
            channel_queue_capacity: 256,
            allowed_origins: Vec::new(),
            liveness_interval_ms: 30_000,
            routing_refresh_interval_ms: 10_000,
            step_delay_ms: 500,
            stats_window_hours: 24,
            merge_buffer_capacity: 10_000,
            failover_history_capacity: 100,
            decision_history_capacity: 50,
            execution_retention: 1_000,
            live_freshness_secs: 30,
            snapshot_max_age_secs: 300,
            default_step_count: 5,
            fault_rate: 0.2,
        }
    }
}

impl DaemonConfig {
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_connections", self.max_connections as u64),
            ("channel_queue_capacity", self.channel_queue_capacity as u64),
            ("liveness_interval_ms", self.liveness_interval_ms),
            ("routing_refresh_interval_ms", self.routing_refresh_interval_ms),
            ("merge_buffer_capacity", self.merge_buffer_capacity as u64),
            ("failover_history_capacity", self.failover_history_capacity as u64),
            ("decision_history_capacity", self.decision_history_capacity as u64),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.stats_window_hours > MAX_STATS_WINDOW_HOURS {
            return Err(ConfigError::Invalid(format!(
                "stats_window_hours must be at most {MAX_STATS_WINDOW_HOURS}"
            )));
        }
        if !(0.0..=1.0).contains(&self.fault_rate) {
            return Err(ConfigError::Invalid(format!(
                "fault_rate must be within [0, 1], got {}",
                self.fault_rate
            )));
        }
        Ok(())
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn routing_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.routing_refresh_interval_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }

    pub fn stats_window(&self) -> chrono::Duration {
        chrono::Duration::try_hours(i64::from(self.stats_window_hours)).unwrap_or(chrono::Duration::MAX)
    }

    pub fn live_freshness(&self) -> chrono::Duration {
        seconds(self.live_freshness_secs)
    }

    pub fn snapshot_max_age(&self) -> chrono::Duration {
        seconds(self.snapshot_max_age_secs)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            failover_capacity: self.failover_history_capacity,
            decision_capacity: self.decision_history_capacity,
            ..RouterConfig::default()
        }
    }
}
