//! EventPublisher: fan-out on top of the registry.
//!
//! Every method is fire-and-forget and returns how many channels the
//! message was queued for. Per-channel order follows submission order
//! because each channel drains a single FIFO queue.

use std::sync::Arc;

use ptexec_core::types::MergedRecord;

use crate::protocol::{
    EXECUTIONS_TOPIC, RECORDS_TOPIC, ServerMessage, execution_topic, records_topic,
};
use crate::registry::{ChannelId, ChannelView, ConnectionRegistry};

#[derive(Clone)]
pub struct EventPublisher {
    registry: Arc<ConnectionRegistry>,
}

impl EventPublisher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn to_channel(&self, id: &ChannelId, msg: &ServerMessage) -> bool {
        self.registry.deliver_to([id], msg) > 0
    }

    pub fn to_user(&self, user_id: &str, msg: &ServerMessage) -> usize {
        self.registry.deliver_to_user(user_id, msg)
    }

    pub fn to_session(&self, session_id: &str, msg: &ServerMessage) -> usize {
        self.registry.deliver_to_session(session_id, msg)
    }

    pub fn to_topic(&self, topic: &str, msg: &ServerMessage) -> usize {
        self.registry.deliver(msg, |view| view.topics.contains(topic))
    }

    /// All channels, or only those accepted by `predicate`.
    pub fn broadcast(
        &self,
        msg: &ServerMessage,
        predicate: Option<&dyn Fn(&ChannelView) -> bool>,
    ) -> usize {
        match predicate {
            Some(accept) => self.registry.deliver(msg, accept),
            None => self.registry.deliver(msg, |_| true),
        }
    }

    /// Execution lifecycle event: once per channel that belongs to `owner`
    /// or follows all executions or this one.
    pub fn publish_execution(&self, owner: &str, execution_id: &str, msg: &ServerMessage) -> usize {
        let topic = execution_topic(execution_id);
        let sent = self.registry.deliver(msg, |view| {
            view.user_id.as_deref() == Some(owner)
                || view.topics.contains(EXECUTIONS_TOPIC)
                || view.topics.contains(&topic)
        });
        tracing::trace!(execution_id, kind = msg.kind(), sent, "execution event published");
        sent
    }

    /// Merged record: once per channel following all records or this producer.
    pub fn publish_record(&self, record: &MergedRecord) -> usize {
        let topic = records_topic(&record.source);
        let msg = ServerMessage::Record {
            record: record.clone(),
        };
        self.registry.deliver(&msg, |view| {
            view.topics.contains(RECORDS_TOPIC) || view.topics.contains(&topic)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Outbound;
    use chrono::Utc;
    use ptexec_core::types::ExecutionStatus;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Peer {
        id: ChannelId,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(item) = self.rx.try_recv() {
                if let Outbound::Message(msg) = item {
                    out.push(msg);
                }
            }
            out
        }
    }

    fn setup(n: usize) -> (EventPublisher, Vec<Peer>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let peers = (0..n)
            .map(|_| {
                let (tx, rx) = mpsc::channel(32);
                Peer {
                    id: registry.register(tx),
                    rx,
                }
            })
            .collect();
        (EventPublisher::new(registry), peers)
    }

    fn queued(id: &str) -> ServerMessage {
        ServerMessage::ExecutionQueued {
            execution_id: id.into(),
            test_case_id: "tc".into(),
            timestamp: Utc::now(),
            status: ExecutionStatus::Queued,
        }
    }

    #[test]
    fn user_and_session_targeting() {
        let (publisher, mut peers) = setup(3);
        let registry = publisher.registry();
        registry.bind(&peers[0].id, "alice", Some("s1"));
        registry.bind(&peers[1].id, "alice", Some("s2"));
        registry.bind(&peers[2].id, "bob", Some("s1"));

        assert_eq!(publisher.to_user("alice", &ServerMessage::error("u")), 2);
        assert_eq!(publisher.to_session("s1", &ServerMessage::error("s")), 2);
        assert_eq!(publisher.to_user("nobody", &ServerMessage::error("n")), 0);

        assert_eq!(peers[0].drain().len(), 2);
        assert_eq!(peers[1].drain().len(), 1);
        assert_eq!(peers[2].drain().len(), 1);
    }

    #[test]
    fn anonymous_channels_only_reachable_by_id() {
        let (publisher, mut peers) = setup(1);
        assert_eq!(publisher.to_user("alice", &ServerMessage::error("u")), 0);
        assert!(publisher.to_channel(&peers[0].id, &ServerMessage::error("direct")));
        assert_eq!(peers[0].drain(), vec![ServerMessage::error("direct")]);
    }

    #[test]
    fn execution_events_reach_each_channel_once() {
        let (publisher, mut peers) = setup(4);
        let registry = publisher.registry();
        // Owner who also follows everything: still one copy.
        registry.bind(&peers[0].id, "alice", None);
        registry.subscribe(&peers[0].id, EXECUTIONS_TOPIC);
        registry.subscribe(&peers[1].id, &execution_topic("e1"));
        registry.subscribe(&peers[2].id, &execution_topic("e2"));
        registry.bind(&peers[3].id, "bob", None);

        assert_eq!(publisher.publish_execution("alice", "e1", &queued("e1")), 2);
        assert_eq!(peers[0].drain().len(), 1);
        assert_eq!(peers[1].drain().len(), 1);
        assert!(peers[2].drain().is_empty());
        assert!(peers[3].drain().is_empty());
    }

    #[test]
    fn broadcast_with_predicate() {
        let (publisher, mut peers) = setup(3);
        publisher.registry().subscribe(&peers[1].id, "records");
        assert_eq!(publisher.broadcast(&ServerMessage::error("all"), None), 3);
        let only_records = |view: &ChannelView| view.topics.contains("records");
        assert_eq!(
            publisher.broadcast(&ServerMessage::error("some"), Some(&only_records)),
            1
        );
        assert_eq!(peers[1].drain().len(), 2);
        assert_eq!(peers[0].drain().len(), 1);
    }

    #[test]
    fn per_channel_order_is_submission_order() {
        let (publisher, mut peers) = setup(1);
        for n in 0..10 {
            publisher.to_channel(&peers[0].id, &ServerMessage::error(n.to_string()));
        }
        let got: Vec<ServerMessage> = peers[0].drain();
        let expected: Vec<ServerMessage> =
            (0..10).map(|n| ServerMessage::error(n.to_string())).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn records_follow_source_topics() {
        let (publisher, mut peers) = setup(3);
        let registry = publisher.registry();
        registry.subscribe(&peers[0].id, RECORDS_TOPIC);
        registry.subscribe(&peers[1].id, &records_topic("sniffer-a"));
        registry.subscribe(&peers[2].id, &records_topic("sniffer-b"));

        let record = MergedRecord {
            seq: 1,
            source: "sniffer-a".into(),
            level: "info".into(),
            timestamp: Utc::now(),
            payload: json!({ "messageType": "Paging" }),
        };
        assert_eq!(publisher.publish_record(&record), 2);
        assert!(peers[2].drain().is_empty());
        assert_eq!(
            peers[1].drain(),
            vec![ServerMessage::Record { record }]
        );
    }

    #[test]
    fn send_to_dead_channel_removes_it() {
        let (publisher, peers) = setup(1);
        let id = peers[0].id.clone();
        drop(peers);
        assert!(!publisher.to_channel(&id, &ServerMessage::error("x")));
        assert!(publisher.registry().is_empty());
    }
}
