use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::messaging::node_id::{MessageId, NodeId};
use crate::ordering::{Delivery, DeliveryMode, MissingPredecessor, StalledMessage};


struct BufferedMessage {
    id: MessageId,
    content: String,
    received_at: Instant,
    stall_reported: bool,
}

/// Per-sender state: everything below `next_expected` was delivered, and the buffer holds
///  received messages at or above it.
#[derive(Default)]
struct SenderStream {
    next_expected: u64,
    buffer: BTreeMap<u64, BufferedMessage>,
}

/// Releases private messages in exactly the order their sender numbered them.
///
/// A gap blocks the sender's stream indefinitely: later messages are buffered rather than
///  delivered out of order, and nothing is ever skipped.
#[derive(Default)]
pub struct FifoEngine {
    senders: FxHashMap<NodeId, SenderStream>,
    seen: FxHashSet<MessageId>,
}

impl FifoEngine {
    pub fn new() -> FifoEngine {
        Default::default()
    }

    /// Returns the messages that became deliverable through this one, in delivery order. That
    ///  can be none (duplicate or gap), or several (this one filled a gap).
    pub fn handle_message(&mut self, id: MessageId, sender: NodeId, content: String, sequence: u64) -> Vec<Delivery> {
        if !self.seen.insert(id) {
            debug!("ignoring duplicate private message {}", id);
            return Vec::new();
        }

        let stream = self.senders.entry(sender).or_default();
        if sequence < stream.next_expected {
            debug!("private message {} from {:?} has sequence number {} which was delivered already - ignoring", id, sender, sequence);
            return Vec::new();
        }

        match stream.buffer.entry(sequence) {
            Entry::Occupied(e) => {
                debug!("private message {} reuses sequence number {} of buffered message {} - ignoring", id, sequence, e.get().id);
                return Vec::new();
            }
            Entry::Vacant(e) => {
                e.insert(BufferedMessage {
                    id,
                    content,
                    received_at: Instant::now(),
                    stall_reported: false,
                });
            }
        }

        let mut delivered = Vec::new();
        while let Some(msg) = stream.buffer.remove(&stream.next_expected) {
            trace!("delivering private message {} (#{}) from {:?}", msg.id, stream.next_expected, sender);
            delivered.push(Delivery::private(sender, msg.content));
            stream.next_expected += 1;
        }

        if delivered.is_empty() {
            debug!("private message {} from {:?} has sequence number {}, waiting for {} - buffered", id, sender, sequence, stream.next_expected);
        }
        delivered
    }

    pub fn next_expected(&self, sender: NodeId) -> u64 {
        self.senders.get(&sender)
            .map(|s| s.next_expected)
            .unwrap_or(0)
    }

    pub fn num_buffered(&self) -> usize {
        self.senders.values()
            .map(|s| s.buffer.len())
            .sum()
    }

    /// Buffered messages that have been waiting for at least `timeout`. Each message is
    ///  returned only once, but it stays buffered.
    pub fn take_newly_stalled(&mut self, now: Instant, timeout: Duration) -> Vec<StalledMessage> {
        let mut result = Vec::new();
        for (&sender, stream) in self.senders.iter_mut() {
            let next_expected = stream.next_expected;
            for msg in stream.buffer.values_mut() {
                let waited = now.saturating_duration_since(msg.received_at);
                if msg.stall_reported || waited < timeout {
                    continue;
                }
                msg.stall_reported = true;
                result.push(StalledMessage {
                    id: msg.id,
                    sender,
                    mode: DeliveryMode::Private,
                    waited,
                    missing: vec![MissingPredecessor::SequenceNumber(next_expected)],
                });
            }
        }
        result.sort_by_key(|s| s.id);
        result
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::time;
    use super::*;

    fn id(sender: usize, counter: u64) -> MessageId {
        MessageId::new(NodeId(sender), counter)
    }

    fn contents(delivered: Vec<Delivery>) -> Vec<String> {
        delivered.into_iter()
            .map(|d| d.content)
            .collect()
    }

    #[test]
    fn test_in_order() {
        let mut engine = FifoEngine::new();
        assert_eq!(engine.handle_message(id(1, 0), NodeId(1), "a".into(), 0), vec![Delivery::private(NodeId(1), "a")]);
        assert_eq!(engine.handle_message(id(1, 1), NodeId(1), "b".into(), 1), vec![Delivery::private(NodeId(1), "b")]);
        assert_eq!(engine.next_expected(NodeId(1)), 2);
        assert_eq!(engine.num_buffered(), 0);
    }

    #[test]
    fn test_gap_fill() {
        let mut engine = FifoEngine::new();

        assert_eq!(contents(engine.handle_message(id(1, 0), NodeId(1), "m0".into(), 0)), vec!["m0"]);
        assert!(engine.handle_message(id(1, 2), NodeId(1), "m2".into(), 2).is_empty());
        assert_eq!(engine.num_buffered(), 1);
        assert_eq!(contents(engine.handle_message(id(1, 1), NodeId(1), "m1".into(), 1)), vec!["m1", "m2"]);
        assert_eq!(engine.num_buffered(), 0);
    }

    #[test]
    fn test_gap_blocks_indefinitely() {
        let mut engine = FifoEngine::new();
        for seq in 1..10 {
            assert!(engine.handle_message(id(1, seq), NodeId(1), format!("m{}", seq), seq).is_empty());
        }
        assert_eq!(engine.next_expected(NodeId(1)), 0);
        assert_eq!(engine.num_buffered(), 9);
    }

    #[test]
    fn test_senders_are_independent() {
        let mut engine = FifoEngine::new();
        assert!(engine.handle_message(id(1, 5), NodeId(1), "from 1".into(), 1).is_empty());
        assert_eq!(contents(engine.handle_message(id(2, 0), NodeId(2), "from 2".into(), 0)), vec!["from 2"]);
    }

    #[test]
    fn test_duplicates_are_delivered_once() {
        let mut engine = FifoEngine::new();
        assert_eq!(contents(engine.handle_message(id(1, 0), NodeId(1), "a".into(), 0)), vec!["a"]);
        assert!(engine.handle_message(id(1, 0), NodeId(1), "a".into(), 0).is_empty());

        // duplicate of a buffered message
        assert!(engine.handle_message(id(1, 2), NodeId(1), "c".into(), 2).is_empty());
        assert!(engine.handle_message(id(1, 2), NodeId(1), "c".into(), 2).is_empty());
        assert_eq!(engine.num_buffered(), 1);

        assert_eq!(contents(engine.handle_message(id(1, 1), NodeId(1), "b".into(), 1)), vec!["b", "c"]);
    }

    #[test]
    fn test_stale_sequence_number_is_dropped() {
        let mut engine = FifoEngine::new();
        engine.handle_message(id(1, 0), NodeId(1), "a".into(), 0);
        assert!(engine.handle_message(id(1, 7), NodeId(1), "late".into(), 0).is_empty());
        assert_eq!(engine.num_buffered(), 0);
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::shuffled(vec![2, 0, 4, 1, 3])]
    #[case::with_duplicates(vec![3, 3, 1, 0, 1, 4, 0, 2, 4, 2])]
    fn test_any_arrival_order_delivers_in_send_order(#[case] arrivals: Vec<u64>) {
        let mut engine = FifoEngine::new();
        let mut delivered = Vec::new();
        for seq in arrivals {
            delivered.extend(contents(engine.handle_message(id(3, seq), NodeId(3), format!("m{}", seq), seq)));
        }
        assert_eq!(delivered, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_newly_stalled() {
        let mut engine = FifoEngine::new();
        engine.handle_message(id(1, 2), NodeId(1), "m2".into(), 2);
        time::advance(Duration::from_secs(5)).await;
        engine.handle_message(id(1, 3), NodeId(1), "m3".into(), 3);

        let stalled = engine.take_newly_stalled(Instant::now(), Duration::from_secs(5));
        assert_eq!(stalled, vec![StalledMessage {
            id: id(1, 2),
            sender: NodeId(1),
            mode: DeliveryMode::Private,
            waited: Duration::from_secs(5),
            missing: vec![MissingPredecessor::SequenceNumber(0)],
        }]);

        // reported only once
        assert!(engine.take_newly_stalled(Instant::now(), Duration::from_secs(5)).is_empty());

        time::advance(Duration::from_secs(5)).await;
        let stalled = engine.take_newly_stalled(Instant::now(), Duration::from_secs(5));
        assert_eq!(stalled.iter().map(|s| s.id).collect::<Vec<_>>(), vec![id(1, 3)]);

        // stalled messages are still released once the gap is filled
        engine.handle_message(id(1, 0), NodeId(1), "m0".into(), 0);
        assert_eq!(contents(engine.handle_message(id(1, 1), NodeId(1), "m1".into(), 1)), vec!["m1", "m2", "m3"]);
    }
}
