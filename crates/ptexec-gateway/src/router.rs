//! SourceRouter: per-request choice between the real, cached and mock
//! sources, with failover and auditable history.
//!
//! Each call to [`SourceRouter::route_request`] produces exactly one
//! [`RoutingDecision`] and then executes against the chosen source. When the
//! source returns nothing the router walks the fallback chain
//! (`real -> cached -> mock`) and records a single [`FailoverEvent`] for the
//! request, naming the decided source and every hop that came back empty.
//! If even mock comes back empty the caller receives a synthesized
//! "all sources unavailable" payload; the router itself never errors.
//!
//! Probes and fetches run outside the state lock. The lock only guards the
//! per-tool bookkeeping (health, success ratios, counters, histories).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use ptexec_core::confidence::{DEFAULT_DECAY_ALPHA, SuccessRatio};
use ptexec_core::health::{HealthPolicy, ProbeSignal, SourceHealth};
use ptexec_core::types::{FailoverEvent, RoutingDecision, SourceType};
use serde::Serialize;
use serde_json::{Value, json};

use crate::sources::{DataSource, HealthProbe};

// ─── Constants ───────────────────────────────────────────────────────

pub const DEFAULT_FAILOVER_CAPACITY: usize = 100;
pub const DEFAULT_DECISION_CAPACITY: usize = 50;

// ─── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Failover ring capacity (oldest evicted).
    pub failover_capacity: usize,
    /// Recent decisions kept per tool.
    pub decision_capacity: usize,
    pub health_policy: HealthPolicy,
    pub decay_alpha: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failover_capacity: DEFAULT_FAILOVER_CAPACITY,
            decision_capacity: DEFAULT_DECISION_CAPACITY,
            health_policy: HealthPolicy::default(),
            decay_alpha: DEFAULT_DECAY_ALPHA,
        }
    }
}

// ─── Results and stats ───────────────────────────────────────────────

/// Outcome of one routed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResult {
    pub decision: RoutingDecision,
    /// Source that actually produced `data`. Differs from
    /// `decision.source` after a failover.
    pub served_by: SourceType,
    pub data: Value,
    /// Set when the decided source returned nothing and a fallback was tried.
    pub failover: Option<FailoverEvent>,
    /// Every source, mock included, returned nothing.
    pub exhausted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRoutingStats {
    pub real: u64,
    pub cached: u64,
    pub mock: u64,
    pub failovers: u64,
    pub total: u64,
    /// Newest last.
    pub recent: VecDeque<RoutingDecision>,
}

impl ToolRoutingStats {
    fn count(&mut self, source: SourceType) {
        let counter = match source {
            SourceType::Real => &mut self.real,
            SourceType::Cached => &mut self.cached,
            SourceType::Mock => &mut self.mock,
        };
        *counter = counter.saturating_add(1);
        self.total = self.total.saturating_add(1);
    }
}

// ─── Internal state ──────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ToolState {
    health: SourceHealth,
    ratios: BTreeMap<SourceType, SuccessRatio>,
    stats: ToolRoutingStats,
}

impl ToolState {
    fn new(alpha: f64, now: DateTime<Utc>) -> Self {
        Self {
            health: SourceHealth::unknown(now),
            ratios: SourceType::ALL
                .into_iter()
                .map(|source| (source, SuccessRatio::new(alpha)))
                .collect(),
            stats: ToolRoutingStats::default(),
        }
    }

    fn ratio(&mut self, source: SourceType, alpha: f64) -> &mut SuccessRatio {
        self.ratios
            .entry(source)
            .or_insert_with(|| SuccessRatio::new(alpha))
    }
}

#[derive(Debug, Default)]
struct RouterState {
    tools: BTreeMap<String, ToolState>,
    failovers: VecDeque<FailoverEvent>,
}

impl RouterState {
    fn tool(&mut self, tool: &str, alpha: f64, now: DateTime<Utc>) -> &mut ToolState {
        self.tools
            .entry(tool.to_string())
            .or_insert_with(|| ToolState::new(alpha, now))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Payload returned when no source, mock included, could answer.
pub fn unavailable_payload(tool: &str, kind: &str) -> Value {
    json!({
        "status": "unavailable",
        "message": "all sources unavailable",
        "tool": tool,
        "requestKind": kind,
    })
}

// ─── SourceRouter ────────────────────────────────────────────────────

pub struct SourceRouter {
    config: RouterConfig,
    probe: Arc<dyn HealthProbe>,
    real: Arc<dyn DataSource>,
    cached: Arc<dyn DataSource>,
    mock: Arc<dyn DataSource>,
    state: Mutex<RouterState>,
}

impl SourceRouter {
    pub fn new(
        config: RouterConfig,
        probe: Arc<dyn HealthProbe>,
        real: Arc<dyn DataSource>,
        cached: Arc<dyn DataSource>,
        mock: Arc<dyn DataSource>,
    ) -> Self {
        Self {
            config,
            probe,
            real,
            cached,
            mock,
            state: Mutex::new(RouterState::default()),
        }
    }

    fn source(&self, source: SourceType) -> &Arc<dyn DataSource> {
        match source {
            SourceType::Real => &self.real,
            SourceType::Cached => &self.cached,
            SourceType::Mock => &self.mock,
        }
    }

    /// Start tracking `tool` so the periodic refresh probes it before its
    /// first request.
    pub fn register_tool(&self, tool: &str) {
        lock(&self.state).tool(tool, self.config.decay_alpha, Utc::now());
    }

    /// Decide, execute, and fail over as needed. Always returns a result.
    pub fn route_request(&self, tool: &str, kind: &str) -> RouteResult {
        let now = Utc::now();
        let decision = self.decide(tool, kind, now);
        let (served_by, data, failover, exhausted) = self.execute(tool, kind, decision.source);
        RouteResult {
            decision,
            served_by,
            data,
            failover,
            exhausted,
        }
    }

    fn decide(&self, tool: &str, kind: &str, now: DateTime<Utc>) -> RoutingDecision {
        let alpha = self.config.decay_alpha;
        let signal = self.probe.probe(tool);
        let mut reasoning = Vec::with_capacity(4);

        let real_ok = {
            let mut state = lock(&self.state);
            let entry = state.tool(tool, alpha, now);
            entry.health.observe(signal, &self.config.health_policy, now);
            reasoning.push(format!(
                "real source {}: {}",
                entry.health.state, entry.health.reason
            ));
            entry.health.is_routable()
        };

        let source = if real_ok {
            SourceType::Real
        } else if self.cached.is_available(tool, kind) {
            reasoning.push("cached snapshot available".to_string());
            SourceType::Cached
        } else {
            reasoning.push("cached snapshot unavailable".to_string());
            reasoning.push("falling back to synthetic data".to_string());
            SourceType::Mock
        };

        let mut state = lock(&self.state);
        let entry = state.tool(tool, alpha, now);
        let ratio = *entry.ratio(source, alpha);
        let confidence = ratio.confidence(source);
        reasoning.push(format!(
            "confidence {confidence:.2} from {source} success ratio {:.2}",
            ratio.value()
        ));

        let decision = RoutingDecision {
            tool: tool.to_string(),
            request_kind: kind.to_string(),
            source,
            confidence,
            reasoning,
            timestamp: now,
        };
        entry.stats.count(source);
        entry.stats.recent.push_back(decision.clone());
        while entry.stats.recent.len() > self.config.decision_capacity.max(1) {
            entry.stats.recent.pop_front();
        }

        tracing::debug!(
            tool,
            request_kind = kind,
            source = %source,
            confidence,
            "routing decision"
        );
        decision
    }

    fn execute(
        &self,
        tool: &str,
        kind: &str,
        start: SourceType,
    ) -> (SourceType, Value, Option<FailoverEvent>, bool) {
        let alpha = self.config.decay_alpha;
        let mut failed = Vec::new();
        let mut current = start;

        let (served_by, data, exhausted) = loop {
            let fetched = self.source(current).fetch(tool, kind);
            lock(&self.state)
                .tool(tool, alpha, Utc::now())
                .ratio(current, alpha)
                .record(fetched.is_some());

            if let Some(data) = fetched {
                if current == SourceType::Real {
                    self.cached.store(tool, kind, &data);
                }
                break (current, data, false);
            }

            failed.push(current);
            match current.fallback() {
                Some(next) => current = next,
                None => {
                    tracing::warn!(tool, request_kind = kind, "all sources unavailable");
                    break (SourceType::Mock, unavailable_payload(tool, kind), true);
                }
            }
        };

        let failover = (start.fallback().is_some() && !failed.is_empty())
            .then(|| self.record_failover(tool, kind, start, &failed));
        (served_by, data, failover, exhausted)
    }

    /// One event per failed-over request, naming the hops that came back empty.
    fn record_failover(
        &self,
        tool: &str,
        kind: &str,
        start: SourceType,
        failed: &[SourceType],
    ) -> FailoverEvent {
        let chain: Vec<&str> = failed.iter().map(|s| s.as_str()).collect();
        let now = Utc::now();
        let event = FailoverEvent {
            timestamp: now,
            tool: tool.to_string(),
            failed_source: start,
            reason: format!("no data for {kind} from {}", chain.join(" -> ")),
        };

        let mut state = lock(&self.state);
        let stats = &mut state.tool(tool, self.config.decay_alpha, now).stats;
        stats.failovers = stats.failovers.saturating_add(1);
        state.failovers.push_back(event.clone());
        while state.failovers.len() > self.config.failover_capacity.max(1) {
            state.failovers.pop_front();
        }
        drop(state);

        tracing::warn!(
            tool,
            request_kind = kind,
            failed_source = %start,
            reason = %event.reason,
            "source failover"
        );
        event
    }

    /// Re-probe every tool seen so far and fold the results into its health.
    /// Returns the number of tools probed.
    pub fn refresh_health(&self) -> usize {
        let tools: Vec<String> = lock(&self.state).tools.keys().cloned().collect();
        let signals: Vec<(String, ProbeSignal)> = tools
            .into_iter()
            .map(|tool| {
                let signal = self.probe.probe(&tool);
                (tool, signal)
            })
            .collect();

        let now = Utc::now();
        let mut state = lock(&self.state);
        for (tool, signal) in &signals {
            let entry = state.tool(tool, self.config.decay_alpha, now);
            let before = entry.health.state;
            entry.health.observe(*signal, &self.config.health_policy, now);
            if entry.health.state != before {
                tracing::info!(
                    tool = %tool,
                    from = ?before,
                    to = ?entry.health.state,
                    reason = %entry.health.reason,
                    "real source health changed"
                );
            }
        }
        signals.len()
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, SourceHealth> {
        lock(&self.state)
            .tools
            .iter()
            .map(|(tool, entry)| (tool.clone(), entry.health.clone()))
            .collect()
    }

    pub fn routing_stats(&self) -> BTreeMap<String, ToolRoutingStats> {
        lock(&self.state)
            .tools
            .iter()
            .map(|(tool, entry)| (tool.clone(), entry.stats.clone()))
            .collect()
    }

    /// Oldest first.
    pub fn failover_history(&self) -> Vec<FailoverEvent> {
        lock(&self.state).failovers.iter().cloned().collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
