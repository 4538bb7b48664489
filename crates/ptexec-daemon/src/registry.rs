//! ConnectionRegistry: the set of live channels, their identity bindings,
//! topic subscriptions and liveness.
//!
//! One mutex guards the primary table together with the user and session
//! indexes, so a lookup never observes a channel that is half removed.
//! Delivery goes through each channel's bounded outbound queue with
//! `try_send`; the registry never awaits a peer.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::protocol::{Outbound, ServerMessage};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    fn generate() -> Self {
        Self(format!("ch-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Read-only copy of one channel's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelView {
    pub id: ChannelId,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub topics: BTreeSet<String>,
    /// Cleared by each sweep, set again by any inbound frame.
    pub alive: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub evicted: Vec<ChannelId>,
}

// ---------------------------------------------------------------------------
// Internal tables
// ---------------------------------------------------------------------------

struct ChannelEntry {
    view: ChannelView,
    tx: mpsc::Sender<Outbound>,
}

#[derive(Default)]
struct Tables {
    channels: HashMap<ChannelId, ChannelEntry>,
    by_user: HashMap<String, HashSet<ChannelId>>,
    by_session: HashMap<String, HashSet<ChannelId>>,
}

fn unindex(index: &mut HashMap<String, HashSet<ChannelId>>, key: &str, id: &ChannelId) {
    if let Some(ids) = index.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            index.remove(key);
        }
    }
}

enum Offer {
    Queued,
    Full,
    Closed,
}

fn offer(id: &ChannelId, entry: &ChannelEntry, msg: &ServerMessage) -> Offer {
    match entry.tx.try_send(Outbound::Message(msg.clone())) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(_)) => {
            tracing::debug!(channel_id = %id, kind = msg.kind(), "channel not ready, message dropped");
            Offer::Full
        }
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

impl Tables {
    /// Offer `msg` to each listed channel by direct lookup. Unknown ids are
    /// skipped; channels whose writer is gone are removed.
    fn send_each(&mut self, ids: &[ChannelId], msg: &ServerMessage) -> usize {
        let mut sent = 0;
        let mut gone = Vec::new();
        for id in ids {
            let Some(entry) = self.channels.get(id) else {
                continue;
            };
            match offer(id, entry, msg) {
                Offer::Queued => sent += 1,
                Offer::Full => {}
                Offer::Closed => gone.push(id.clone()),
            }
        }
        self.drop_gone(gone);
        sent
    }

    fn drop_gone(&mut self, gone: Vec<ChannelId>) {
        for id in gone {
            self.remove(&id);
            tracing::debug!(channel_id = %id, "send failed, channel removed");
        }
    }

    fn remove(&mut self, id: &ChannelId) -> Option<ChannelEntry> {
        let entry = self.channels.remove(id)?;
        if let Some(user) = &entry.view.user_id {
            unindex(&mut self.by_user, user, id);
        }
        if let Some(session) = &entry.view.session_id {
            unindex(&mut self.by_session, session, id);
        }
        Some(entry)
    }
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ConnectionRegistry {
    tables: Mutex<Tables>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a channel whose writer drains `tx`. New channels start alive and
    /// anonymous.
    pub fn register(&self, tx: mpsc::Sender<Outbound>) -> ChannelId {
        let id = ChannelId::generate();
        let now = Utc::now();
        let view = ChannelView {
            id: id.clone(),
            user_id: None,
            session_id: None,
            topics: BTreeSet::new(),
            alive: true,
            connected_at: now,
            last_activity: now,
        };
        let mut tables = self.tables();
        tables.channels.insert(id.clone(), ChannelEntry { view, tx });
        tracing::debug!(channel_id = %id, total = tables.channels.len(), "channel registered");
        id
    }

    /// Bind the channel to a user and optionally a session, replacing any
    /// previous binding. Returns `false` if the channel is gone.
    pub fn bind(&self, id: &ChannelId, user_id: &str, session_id: Option<&str>) -> bool {
        let mut guard = self.tables();
        let tables = &mut *guard;
        let Some(entry) = tables.channels.get_mut(id) else {
            return false;
        };

        if let Some(old) = entry.view.user_id.take() {
            unindex(&mut tables.by_user, &old, id);
        }
        if let Some(old) = entry.view.session_id.take() {
            unindex(&mut tables.by_session, &old, id);
        }

        entry.view.user_id = Some(user_id.to_string());
        tables
            .by_user
            .entry(user_id.to_string())
            .or_default()
            .insert(id.clone());
        if let Some(session) = session_id {
            entry.view.session_id = Some(session.to_string());
            tables
                .by_session
                .entry(session.to_string())
                .or_default()
                .insert(id.clone());
        }
        tracing::info!(channel_id = %id, user_id, session_id = ?session_id, "channel authenticated");
        true
    }

    pub fn subscribe(&self, id: &ChannelId, topic: &str) -> bool {
        match self.tables().channels.get_mut(id) {
            Some(entry) => {
                entry.view.topics.insert(topic.to_string());
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe(&self, id: &ChannelId, topic: &str) -> bool {
        match self.tables().channels.get_mut(id) {
            Some(entry) => {
                entry.view.topics.remove(topic);
                true
            }
            None => false,
        }
    }

    /// Record inbound activity on the channel.
    pub fn mark_alive(&self, id: &ChannelId) -> bool {
        match self.tables().channels.get_mut(id) {
            Some(entry) => {
                entry.view.alive = true;
                entry.view.last_activity = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Evict every channel that stayed silent since the previous sweep and
    /// probe the rest.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let mut tables = self.tables();

        let mut doomed = Vec::new();
        for (id, entry) in tables.channels.iter_mut() {
            if !entry.view.alive {
                doomed.push(id.clone());
                continue;
            }
            entry.view.alive = false;
            match entry.tx.try_send(Outbound::Probe) {
                Ok(()) => report.probed += 1,
                // A backed-up writer still counts as probed; the next sweep decides.
                Err(TrySendError::Full(_)) => report.probed += 1,
                Err(TrySendError::Closed(_)) => doomed.push(id.clone()),
            }
        }

        for id in doomed {
            if let Some(entry) = tables.remove(&id) {
                let _ = entry.tx.try_send(Outbound::Close);
                tracing::info!(channel_id = %id, "channel evicted by liveness sweep");
                report.evicted.push(id);
            }
        }
        report
    }

    /// Drop the channel and its index entries. Idempotent.
    pub fn remove(&self, id: &ChannelId) -> bool {
        let removed = self.tables().remove(id).is_some();
        if removed {
            tracing::debug!(channel_id = %id, "channel removed");
        }
        removed
    }

    /// Hand `msg` to every channel matching `filter`. Channels whose queue is
    /// full are skipped; channels whose writer is gone are removed.
    /// Returns the number of channels the message was queued for.
    pub fn deliver<F>(&self, msg: &ServerMessage, filter: F) -> usize
    where
        F: Fn(&ChannelView) -> bool,
    {
        let mut tables = self.tables();
        let mut sent = 0;
        let mut gone = Vec::new();

        for (id, entry) in &tables.channels {
            if !filter(&entry.view) {
                continue;
            }
            match offer(id, entry, msg) {
                Offer::Queued => sent += 1,
                Offer::Full => {}
                Offer::Closed => gone.push(id.clone()),
            }
        }
        tables.drop_gone(gone);
        sent
    }

    /// Deliver to the listed channels only.
    pub fn deliver_to<'a, I>(&self, ids: I, msg: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a ChannelId>,
    {
        let ids: Vec<ChannelId> = ids.into_iter().cloned().collect();
        if ids.is_empty() {
            return 0;
        }
        self.tables().send_each(&ids, msg)
    }

    /// Deliver to every channel bound to `user_id`, found through the user index.
    pub fn deliver_to_user(&self, user_id: &str, msg: &ServerMessage) -> usize {
        let mut tables = self.tables();
        let ids: Vec<ChannelId> = tables
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        tables.send_each(&ids, msg)
    }

    /// Deliver to every channel bound to `session_id`, found through the
    /// session index.
    pub fn deliver_to_session(&self, session_id: &str, msg: &ServerMessage) -> usize {
        let mut tables = self.tables();
        let ids: Vec<ChannelId> = tables
            .by_session
            .get(session_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        tables.send_each(&ids, msg)
    }

    pub fn snapshot(&self, id: &ChannelId) -> Option<ChannelView> {
        self.tables().channels.get(id).map(|entry| entry.view.clone())
    }

    pub fn channels_for_user(&self, user_id: &str) -> HashSet<ChannelId> {
        self.tables().by_user.get(user_id).cloned().unwrap_or_default()
    }

    pub fn channels_for_session(&self, session_id: &str) -> HashSet<ChannelId> {
        self.tables()
            .by_session
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.tables().channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sweep every `period` until cancelled. The first sweep happens one period
/// after start.
pub async fn run_liveness(
    registry: Arc<ConnectionRegistry>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = registry.sweep();
                if !report.evicted.is_empty() {
                    tracing::info!(
                        probed = report.probed,
                        evicted = report.evicted.len(),
                        "liveness sweep"
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("liveness sweep stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(registry: &ConnectionRegistry, depth: usize) -> (ChannelId, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(depth);
        (registry.register(tx), rx)
    }

    fn msg() -> ServerMessage {
        ServerMessage::error("x")
    }

    #[test]
    fn ids_are_unique() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 4);
        let (b, _rb) = channel(&registry, 4);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("ch-"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn bind_indexes_user_and_session() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 4);
        let (b, _rb) = channel(&registry, 4);
        assert!(registry.bind(&a, "alice", Some("s1")));
        assert!(registry.bind(&b, "alice", None));

        assert_eq!(registry.channels_for_user("alice").len(), 2);
        assert_eq!(registry.channels_for_session("s1"), HashSet::from([a.clone()]));
        assert!(!registry.bind(&ChannelId::from("ch-missing"), "bob", None));
    }

    #[test]
    fn rebind_moves_index_entries() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 4);
        registry.bind(&a, "alice", Some("s1"));
        registry.bind(&a, "bob", Some("s2"));
        assert!(registry.channels_for_user("alice").is_empty());
        assert!(registry.channels_for_session("s1").is_empty());
        assert_eq!(registry.channels_for_user("bob").len(), 1);
    }

    #[test]
    fn remove_is_idempotent_and_cleans_indexes() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 4);
        registry.bind(&a, "alice", Some("s1"));
        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert!(registry.channels_for_user("alice").is_empty());
        assert!(registry.channels_for_session("s1").is_empty());
        assert!(registry.snapshot(&a).is_none());
    }

    #[test]
    fn silent_channel_is_evicted_on_second_sweep() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = channel(&registry, 4);
        registry.bind(&a, "alice", Some("s1"));

        let first = registry.sweep();
        assert_eq!(first.probed, 1);
        assert!(first.evicted.is_empty());
        assert_eq!(ra.try_recv().expect("probe queued"), Outbound::Probe);

        let second = registry.sweep();
        assert_eq!(second.evicted, vec![a.clone()]);
        assert_eq!(ra.try_recv().expect("close queued"), Outbound::Close);
        assert!(registry.is_empty());
        assert!(registry.channels_for_user("alice").is_empty());
        assert!(registry.channels_for_session("s1").is_empty());
    }

    #[test]
    fn responsive_channel_survives_sweeps() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 16);
        for _ in 0..5 {
            assert!(registry.sweep().evicted.is_empty());
            registry.mark_alive(&a);
        }
        assert_eq!(registry.len(), 1);
        assert!(registry.snapshot(&a).expect("present").alive);
    }

    #[test]
    fn sweep_evicts_channels_whose_writer_is_gone() {
        let registry = ConnectionRegistry::new();
        let (a, ra) = channel(&registry, 4);
        drop(ra);
        assert_eq!(registry.sweep().evicted, vec![a]);
    }

    #[test]
    fn deliver_skips_full_queue_and_removes_closed() {
        let registry = ConnectionRegistry::new();
        let (full, _rf) = channel(&registry, 1);
        let (closed, rc) = channel(&registry, 4);
        let (ok, mut rok) = channel(&registry, 4);
        drop(rc);

        assert_eq!(registry.deliver(&msg(), |v| v.id == full), 1);
        // Queue of depth 1 is now full: silent drop, channel kept.
        assert_eq!(registry.deliver(&msg(), |v| v.id == full), 0);
        assert!(registry.snapshot(&full).is_some());

        assert_eq!(registry.deliver(&msg(), |_| true), 1);
        assert!(registry.snapshot(&closed).is_none());
        assert!(matches!(rok.try_recv(), Ok(Outbound::Message(_))));
        assert!(registry.snapshot(&ok).is_some());
    }

    #[test]
    fn indexed_delivery_follows_bindings() {
        let registry = ConnectionRegistry::new();
        let (a, mut ra) = channel(&registry, 4);
        let (b, rb) = channel(&registry, 4);
        registry.bind(&a, "alice", Some("s1"));
        registry.bind(&b, "alice", Some("s1"));
        registry.bind(&a, "bob", Some("s2"));

        assert_eq!(registry.deliver_to_user("bob", &msg()), 1);
        assert_eq!(registry.deliver_to_session("s2", &msg()), 1);
        assert_eq!(ra.try_recv().ok(), Some(Outbound::Message(msg())));

        // The closed writer is found through the index and dropped from it.
        drop(rb);
        assert_eq!(registry.deliver_to_user("alice", &msg()), 0);
        assert!(registry.snapshot(&b).is_none());
        assert!(registry.channels_for_user("alice").is_empty());
        assert!(registry.channels_for_session("s1").is_empty());

        let missing = ChannelId::from("ch-missing");
        assert_eq!(registry.deliver_to([&missing, &a], &msg()), 1);
    }

    #[test]
    fn subscriptions_are_per_channel() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = channel(&registry, 4);
        assert!(registry.subscribe(&a, "executions"));
        assert!(registry.subscribe(&a, "records"));
        assert!(registry.unsubscribe(&a, "records"));
        let view = registry.snapshot(&a).expect("present");
        assert_eq!(view.topics, BTreeSet::from(["executions".to_string()]));
        assert!(!registry.subscribe(&ChannelId::from("ch-missing"), "executions"));
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_task_evicts_silent_channels() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (_a, _ra) = channel(&registry, 4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_liveness(
            Arc::clone(&registry),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(registry.len(), 1);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        task.await.expect("liveness task joins");
    }
}
