//! Data-source capabilities consulted by [`crate::router::SourceRouter`].
//!
//! The router never talks to a backend directly. It asks a [`HealthProbe`]
//! whether the real source is up and calls [`DataSource::fetch`] on one of
//! three sources: live records from the merger, a snapshot cache refreshed
//! from successful live reads, and a synthetic generator that always answers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use ptexec_core::health::ProbeSignal;
use ptexec_core::types::MergedRecord;
use serde_json::{Value, json};

use crate::merger::StreamMerger;

// ─── Constants ───────────────────────────────────────────────────────

/// A producer counts as live if it pushed a record within this window.
pub const DEFAULT_LIVE_FRESHNESS_SECS: i64 = 30;

/// Cached snapshots older than this are treated as unavailable.
pub const DEFAULT_SNAPSHOT_MAX_AGE_SECS: i64 = 300;

/// Upper bound on records returned by one live fetch.
pub const DEFAULT_LIVE_FETCH_LIMIT: usize = 200;

/// Request kind that asks for protocol message records.
pub const MESSAGES_KIND: &str = "messages";

// ─── Capabilities ────────────────────────────────────────────────────

/// Reports the health of the real source for a tool.
pub trait HealthProbe: Send + Sync {
    fn probe(&self, tool: &str) -> ProbeSignal;
}

/// One backing source the router can execute a request against.
pub trait DataSource: Send + Sync {
    /// Cheap availability check used while deciding, before any fetch.
    fn is_available(&self, _tool: &str, _kind: &str) -> bool {
        true
    }

    /// `None` means the source had nothing to answer with.
    fn fetch(&self, tool: &str, kind: &str) -> Option<Value>;

    /// Offer data served by a higher-confidence source. Ignored by default.
    fn store(&self, _tool: &str, _kind: &str, _data: &Value) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn record_json(record: &MergedRecord) -> Value {
    json!({
        "seq": record.seq,
        "source": record.source,
        "level": record.level,
        "timestamp": record.timestamp,
        "payload": record.payload,
    })
}

// ─── LiveSource ──────────────────────────────────────────────────────

/// Real source: records that producers labelled with the tool name pushed
/// into the merger.
///
/// A record whose payload carries a string `kind` only answers requests of
/// that kind; records without one answer any kind.
pub struct LiveSource {
    merger: Arc<StreamMerger>,
    freshness: Duration,
    limit: usize,
}

impl LiveSource {
    pub fn new(merger: Arc<StreamMerger>, freshness: Duration) -> Self {
        Self {
            merger,
            freshness,
            limit: DEFAULT_LIVE_FETCH_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    fn is_fresh(&self, tool: &str, now: DateTime<Utc>) -> bool {
        self.merger
            .last_seen(tool)
            .is_some_and(|seen| now - seen <= self.freshness)
    }

    pub fn fetch_at(&self, tool: &str, kind: &str, now: DateTime<Utc>) -> Option<Value> {
        if !self.is_fresh(tool, now) {
            return None;
        }
        let records: Vec<Value> = self
            .merger
            .recent(self.limit, Some(tool))
            .iter()
            .filter(|r| r.payload.get("kind").and_then(Value::as_str).is_none_or(|k| k == kind))
            .map(record_json)
            .collect();
        if records.is_empty() {
            return None;
        }
        Some(json!({ "tool": tool, "requestKind": kind, "records": records }))
    }

    pub fn probe_at(&self, tool: &str, now: DateTime<Utc>) -> ProbeSignal {
        match self.merger.last_seen(tool) {
            None => ProbeSignal::Error,
            Some(seen) if now - seen <= self.freshness => ProbeSignal::Success,
            Some(_) => ProbeSignal::Timeout,
        }
    }
}

impl DataSource for LiveSource {
    fn is_available(&self, tool: &str, _kind: &str) -> bool {
        self.is_fresh(tool, Utc::now())
    }

    fn fetch(&self, tool: &str, kind: &str) -> Option<Value> {
        self.fetch_at(tool, kind, Utc::now())
    }
}

/// Fresh producer: success. Stale: timeout. Never seen: error.
impl HealthProbe for LiveSource {
    fn probe(&self, tool: &str) -> ProbeSignal {
        self.probe_at(tool, Utc::now())
    }
}

// ─── SnapshotCache ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Snapshot {
    data: Value,
    stored_at: DateTime<Utc>,
}

/// Cached source: the last successful real answer per (tool, kind).
pub struct SnapshotCache {
    max_age: Duration,
    entries: Mutex<HashMap<(String, String), Snapshot>>,
}

impl SnapshotCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            max_age,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store_at(&self, tool: &str, kind: &str, data: Value, now: DateTime<Utc>) {
        lock(&self.entries).insert(
            (tool.to_string(), kind.to_string()),
            Snapshot {
                data,
                stored_at: now,
            },
        );
    }

    pub fn fetch_at(&self, tool: &str, kind: &str, now: DateTime<Utc>) -> Option<Value> {
        let entries = lock(&self.entries);
        let snapshot = entries.get(&(tool.to_string(), kind.to_string()))?;
        if now - snapshot.stored_at > self.max_age {
            return None;
        }
        Some(snapshot.data.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_SNAPSHOT_MAX_AGE_SECS))
    }
}

impl DataSource for SnapshotCache {
    fn is_available(&self, tool: &str, kind: &str) -> bool {
        self.fetch_at(tool, kind, Utc::now()).is_some()
    }

    fn fetch(&self, tool: &str, kind: &str) -> Option<Value> {
        self.fetch_at(tool, kind, Utc::now())
    }

    fn store(&self, tool: &str, kind: &str, data: &Value) {
        self.store_at(tool, kind, data.clone(), Utc::now());
    }
}

// ─── SyntheticSource ─────────────────────────────────────────────────

/// Attach procedure used for synthetic `messages` answers.
const ATTACH_PROCEDURE: [(&str, &str, &str); 8] = [
    ("RRC", "UL", "RRCSetupRequest"),
    ("RRC", "DL", "RRCSetup"),
    ("RRC", "UL", "RRCSetupComplete"),
    ("NAS", "UL", "RegistrationRequest"),
    ("NAS", "DL", "AuthenticationRequest"),
    ("NAS", "UL", "AuthenticationResponse"),
    ("NAS", "DL", "SecurityModeCommand"),
    ("NAS", "UL", "RegistrationComplete"),
];

/// Mock source: canned data for any tool and kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticSource;

impl DataSource for SyntheticSource {
    fn fetch(&self, tool: &str, kind: &str) -> Option<Value> {
        if kind != MESSAGES_KIND {
            return Some(json!({ "synthetic": true, "tool": tool, "requestKind": kind }));
        }
        let records: Vec<Value> = ATTACH_PROCEDURE
            .iter()
            .enumerate()
            .map(|(i, (layer, direction, message_type))| {
                json!({
                    "seq": i + 1,
                    "source": tool,
                    "level": "info",
                    "payload": {
                        "layer": layer,
                        "direction": direction,
                        "messageType": message_type,
                    },
                })
            })
            .collect();
        Some(json!({ "tool": tool, "requestKind": kind, "synthetic": true, "records": records }))
    }
}

// ─── StaticProbe ─────────────────────────────────────────────────────

/// Probe with operator-set signals per tool, for tests and pinned
/// deployments.
pub struct StaticProbe {
    default: ProbeSignal,
    signals: Mutex<HashMap<String, ProbeSignal>>,
}

impl StaticProbe {
    pub fn new(default: ProbeSignal) -> Self {
        Self {
            default,
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, tool: &str, signal: ProbeSignal) {
        lock(&self.signals).insert(tool.to_string(), signal);
    }
}

impl HealthProbe for StaticProbe {
    fn probe(&self, tool: &str) -> ProbeSignal {
        lock(&self.signals).get(tool).copied().unwrap_or(self.default)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use ptexec_core::types::RecordDraft;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .expect("valid RFC3339 timestamp")
            .with_timezone(&Utc)
            + Duration::seconds(secs)
    }

    fn live_with(records: &[(&str, Value, i64)]) -> (Arc<StreamMerger>, LiveSource) {
        let merger = Arc::new(StreamMerger::new(100));
        for (source, payload, at) in records {
            merger.publish_at(RecordDraft::new(*source, payload.clone()), t(*at));
        }
        let live = LiveSource::new(Arc::clone(&merger), Duration::seconds(30));
        (merger, live)
    }

    #[test]
    fn live_probe_tracks_freshness() {
        let (_merger, live) = live_with(&[("sniffer", json!({}), 0)]);
        assert_eq!(live.probe_at("sniffer", t(10)), ProbeSignal::Success);
        assert_eq!(live.probe_at("sniffer", t(31)), ProbeSignal::Timeout);
        assert_eq!(live.probe_at("other", t(10)), ProbeSignal::Error);
    }

    #[test]
    fn live_fetch_filters_by_tool_and_kind() {
        let (_merger, live) = live_with(&[
            ("sniffer", json!({ "kind": "messages", "messageType": "RRCSetup" }), 0),
            ("sniffer", json!({ "kind": "kpis", "rsrp": -90 }), 1),
            ("sniffer", json!({ "messageType": "Untagged" }), 2),
            ("other", json!({ "kind": "messages" }), 3),
        ]);
        let data = live.fetch_at("sniffer", "messages", t(5)).expect("fresh data");
        let records = data["records"].as_array().expect("records array");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["payload"]["messageType"], "RRCSetup");
        assert_eq!(records[1]["payload"]["messageType"], "Untagged");
    }

    #[test]
    fn live_fetch_is_empty_when_stale() {
        let (_merger, live) = live_with(&[("sniffer", json!({}), 0)]);
        assert!(live.fetch_at("sniffer", "messages", t(60)).is_none());
        assert!(live.fetch_at("nobody", "messages", t(0)).is_none());
    }

    #[test]
    fn snapshot_expires_after_max_age() {
        let cache = SnapshotCache::new(Duration::seconds(300));
        cache.store_at("sniffer", "messages", json!({ "n": 1 }), t(0));
        assert_eq!(cache.fetch_at("sniffer", "messages", t(300)), Some(json!({ "n": 1 })));
        assert!(cache.fetch_at("sniffer", "messages", t(301)).is_none());
        assert!(cache.fetch_at("sniffer", "kpis", t(0)).is_none());
    }

    #[test]
    fn synthetic_messages_form_attach_procedure() {
        let data = SyntheticSource.fetch("sim", MESSAGES_KIND).expect("always answers");
        let records = data["records"].as_array().expect("records array");
        assert_eq!(records.len(), ATTACH_PROCEDURE.len());
        assert_eq!(records[0]["payload"]["messageType"], "RRCSetupRequest");
        assert_eq!(data["synthetic"], true);
    }

    #[test]
    fn synthetic_other_kinds_are_flagged() {
        let data = SyntheticSource.fetch("sim", "kpis").expect("always answers");
        assert_eq!(data, json!({ "synthetic": true, "tool": "sim", "requestKind": "kpis" }));
    }

    #[test]
    fn static_probe_overrides_default() {
        let probe = StaticProbe::new(ProbeSignal::Success);
        probe.set("flaky", ProbeSignal::Timeout);
        assert_eq!(probe.probe("flaky"), ProbeSignal::Timeout);
        assert_eq!(probe.probe("steady"), ProbeSignal::Success);
    }
}
