//! StreamMerger: folds records from independent producers into one bounded,
//! arrival-ordered buffer and republishes each record to subscribers.
//!
//! The buffer is a hard-capacity ring: once full, every insert evicts the
//! oldest record. Subscriber callbacks run after the buffer lock is
//! released and each one behind its own unwind barrier, so a panicking
//! subscriber can neither block the others nor leave the buffer half-written.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use ptexec_core::types::{MergedRecord, RecordDraft};
use serde::Serialize;

// ─── Constants ───────────────────────────────────────────────────────

/// Default buffer capacity.
pub const DEFAULT_MERGE_CAPACITY: usize = 10_000;

// ─── Types ───────────────────────────────────────────────────────────

type Callback = Arc<dyn Fn(&MergedRecord) + Send + Sync>;

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: Vec<(u64, Callback)>,
}

#[derive(Debug, Default)]
struct Buffer {
    records: VecDeque<MergedRecord>,
    next_seq: u64,
    evicted: u64,
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Counts over the records currently buffered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergerStats {
    pub total: usize,
    pub capacity: usize,
    pub total_published: u64,
    pub evicted: u64,
    pub by_source: BTreeMap<String, usize>,
    pub by_level: BTreeMap<String, usize>,
}

/// Handle returned by [`StreamMerger::subscribe`]. Dropping it detaches the
/// callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    table: Weak<Mutex<SubscriberTable>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            lock(&table).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── StreamMerger ────────────────────────────────────────────────────

pub struct StreamMerger {
    capacity: usize,
    buffer: Mutex<Buffer>,
    subscribers: Arc<Mutex<SubscriberTable>>,
}

impl StreamMerger {
    /// Create a merger holding at most `capacity` records (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer::default()),
            subscribers: Arc::new(Mutex::new(SubscriberTable::default())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        lock(&self.buffer).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a record stamped with the current time.
    pub fn publish(&self, draft: RecordDraft) -> MergedRecord {
        self.publish_at(draft, Utc::now())
    }

    /// Append a record arriving at `now`, evicting the oldest if full, then
    /// notify subscribers.
    ///
    /// Arrival timestamps never go backwards: a `now` earlier than the newest
    /// buffered record is raised to that record's timestamp.
    pub fn publish_at(&self, draft: RecordDraft, now: DateTime<Utc>) -> MergedRecord {
        let record = {
            let mut buf = lock(&self.buffer);
            let timestamp = match buf.records.back() {
                Some(newest) if newest.timestamp > now => newest.timestamp,
                _ => now,
            };
            buf.next_seq = buf.next_seq.saturating_add(1);
            let record = MergedRecord {
                seq: buf.next_seq,
                source: draft.source,
                level: draft.level,
                timestamp,
                payload: draft.payload,
            };
            buf.last_seen.insert(record.source.clone(), timestamp);
            buf.records.push_back(record.clone());
            while buf.records.len() > self.capacity {
                buf.records.pop_front();
                buf.evicted = buf.evicted.saturating_add(1);
            }
            record
        };

        self.notify(&record);
        record
    }

    fn notify(&self, record: &MergedRecord) {
        let callbacks: Vec<(u64, Callback)> = lock(&self.subscribers).entries.clone();
        for (id, callback) in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(record))).is_err() {
                tracing::warn!(
                    subscriber = id,
                    seq = record.seq,
                    source = %record.source,
                    "merger subscriber panicked, skipping"
                );
            }
        }
    }

    /// Register a callback invoked synchronously for every published record.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&MergedRecord) + Send + Sync + 'static,
    {
        let mut table = lock(&self.subscribers);
        table.next_id = table.next_id.saturating_add(1);
        let id = table.next_id;
        table.entries.push((id, Arc::new(callback)));
        Subscription {
            id,
            table: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).entries.len()
    }

    /// The newest `count` records (optionally from one source), oldest first.
    pub fn recent(&self, count: usize, source: Option<&str>) -> Vec<MergedRecord> {
        let buf = lock(&self.buffer);
        let mut out: Vec<MergedRecord> = buf
            .records
            .iter()
            .rev()
            .filter(|r| source.is_none_or(|s| r.source == s))
            .take(count)
            .cloned()
            .collect();
        out.reverse();
        out
    }

    /// Records with `start <= timestamp <= end`, oldest first.
    pub fn by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source: Option<&str>,
    ) -> Vec<MergedRecord> {
        let buf = lock(&self.buffer);
        buf.records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .filter(|r| source.is_none_or(|s| r.source == s))
            .cloned()
            .collect()
    }

    /// Arrival time of the newest record ever seen from `source`, including
    /// records that have since been evicted.
    pub fn last_seen(&self, source: &str) -> Option<DateTime<Utc>> {
        lock(&self.buffer).last_seen.get(source).copied()
    }

    pub fn stats(&self) -> MergerStats {
        let buf = lock(&self.buffer);
        let mut by_source = BTreeMap::new();
        let mut by_level = BTreeMap::new();
        for record in &buf.records {
            *by_source.entry(record.source.clone()).or_insert(0) += 1;
            *by_level.entry(record.level.clone()).or_insert(0) += 1;
        }
        MergerStats {
            total: buf.records.len(),
            capacity: self.capacity,
            total_published: buf.next_seq,
            evicted: buf.evicted,
            by_source,
            by_level,
        }
    }
}

impl Default for StreamMerger {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_CAPACITY)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────
