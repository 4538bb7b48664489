//! Real-source health state machine used by routing.
//!
//! [`SourceHealth::observe`] is the single entry point for state changes.
//! A source only counts as routable while it is [`SourceHealthState::Healthy`];
//! a single failed probe demotes it to `Degraded`, and coming back from
//! `Unhealthy` takes `recovery_threshold` consecutive successes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default probe period for the periodic routing-health refresh (seconds).
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHealthState {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Recovering,
    Disabled,
}

impl SourceHealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Recovering => "recovering",
            Self::Disabled => "disabled",
        }
    }
}

impl fmt::Display for SourceHealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one health probe against a real source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeSignal {
    Success,
    Timeout,
    Error,
    Disabled,
}

impl ProbeSignal {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthPolicy {
    /// Consecutive failures before `Degraded` becomes `Unhealthy`.
    pub failure_threshold: u32,
    /// Consecutive successes needed to leave `Unhealthy`/`Recovering`.
    pub recovery_threshold: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 2,
            recovery_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub state: SourceHealthState,
    pub reason: String,
    pub checked_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

impl SourceHealth {
    pub fn unknown(now: DateTime<Utc>) -> Self {
        Self {
            state: SourceHealthState::Unknown,
            reason: "not probed yet".to_string(),
            checked_at: now,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }

    pub fn is_routable(&self) -> bool {
        self.state == SourceHealthState::Healthy
    }

    /// Fold one probe outcome into the health record.
    pub fn observe(&mut self, signal: ProbeSignal, policy: &HealthPolicy, now: DateTime<Utc>) {
        self.checked_at = now;

        // Disabled is sticky.
        if self.state == SourceHealthState::Disabled || signal == ProbeSignal::Disabled {
            self.state = SourceHealthState::Disabled;
            self.reason = "source disabled".to_string();
            self.consecutive_failures = 0;
            self.consecutive_successes = 0;
            return;
        }

        let failure_threshold = policy.failure_threshold.max(1);
        let recovery_threshold = policy.recovery_threshold.max(1);

        if signal.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.state = match self.state {
                SourceHealthState::Unhealthy | SourceHealthState::Recovering
                    if self.consecutive_successes < recovery_threshold =>
                {
                    SourceHealthState::Recovering
                }
                _ => SourceHealthState::Healthy,
            };
            self.reason = if self.state == SourceHealthState::Recovering {
                format!(
                    "recovering ({}/{recovery_threshold})",
                    self.consecutive_successes
                )
            } else {
                "probe succeeded".to_string()
            };
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.state = if self.consecutive_failures >= failure_threshold {
                SourceHealthState::Unhealthy
            } else {
                SourceHealthState::Degraded
            };
            self.reason = match signal {
                ProbeSignal::Timeout => "probe timeout",
                _ => "probe error",
            }
            .to_string();
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
