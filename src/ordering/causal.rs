use std::collections::BTreeMap;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messaging::node_id::{MessageId, NodeId};
use crate::ordering::vector_clock::VectorClock;
use crate::ordering::{Delivery, DeliveryMode, MissingPredecessor, StalledMessage};


struct BufferedBroadcast {
    sender: NodeId,
    content: String,
    clock: VectorClock,
    received_at: Instant,
    stall_reported: bool,
}

/// Releases broadcasts in causal order, based on vector clocks.
///
/// A broadcast from `S` with clock `V` is deliverable against the local clock `C` if it is the
///  next message originated by `S` that was not seen yet (`V[S] == C[S] + 1`), and if everything
///  `S` had delivered from other nodes when sending it was delivered here as well
///  (`V[i] <= C[i]` for all `i != S`).
///
/// Concurrent broadcasts (no causal relationship) may be delivered in either order.
pub struct CausalEngine {
    myself: NodeId,
    clock: VectorClock,
    /// ordered by id to make the delivery order of concurrent messages deterministic
    buffer: BTreeMap<MessageId, BufferedBroadcast>,
    delivered: FxHashSet<MessageId>,
}

impl CausalEngine {
    pub fn new(myself: NodeId, num_nodes: usize) -> CausalEngine {
        CausalEngine {
            myself,
            clock: VectorClock::new(num_nodes),
            buffer: Default::default(),
            delivered: Default::default(),
        }
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Counts a new broadcast originated by this node, returning the clock to stamp it with
    pub fn next_broadcast_clock(&mut self) -> VectorClock {
        self.clock.increment(self.myself);
        self.clock.snapshot()
    }

    /// Returns the messages that became deliverable through this one, in delivery order. A
    ///  single message can release a cascade of previously buffered ones.
    pub fn handle_message(&mut self, id: MessageId, sender: NodeId, clock: VectorClock, content: String) -> Vec<Delivery> {
        if self.delivered.contains(&id) || self.buffer.contains_key(&id) {
            debug!("ignoring duplicate broadcast {}", id);
            return Vec::new();
        }

        if clock.len() != self.clock.len() || sender.index() >= self.clock.len() {
            warn!("broadcast {} from {:?} has clock {:?} which does not match the number of nodes {} - ignoring", id, sender, clock, self.clock.len());
            return Vec::new();
        }

        if clock.get(sender) <= self.clock.get(sender) {
            warn!("broadcast {} from {:?} has clock {:?}, but broadcast #{} from that node was delivered already - ignoring", id, sender, clock, clock.get(sender));
            return Vec::new();
        }

        self.buffer.insert(id, BufferedBroadcast {
            sender,
            content,
            clock,
            received_at: Instant::now(),
            stall_reported: false,
        });

        let delivered = self.deliver_buffered();
        if delivered.is_empty() {
            debug!("broadcast {} from {:?} cannot be delivered against local clock {:?} - buffered", id, sender, self.clock);
        }
        delivered
    }

    fn deliver_buffered(&mut self) -> Vec<Delivery> {
        let mut delivered = Vec::new();

        // delivering a message advances the local clock, which can make other buffered messages
        //  deliverable, so scanning restarts after each delivery
        while let Some(id) = self.next_deliverable() {
            if let Some(msg) = self.buffer.remove(&id) {
                self.clock.merge(&msg.clock);
                self.delivered.insert(id);
                trace!("delivering broadcast {} from {:?}, local clock is now {:?}", id, msg.sender, self.clock);
                delivered.push(Delivery::broadcast(msg.sender, msg.content));
            }
        }
        delivered
    }

    fn next_deliverable(&self) -> Option<MessageId> {
        self.buffer.iter()
            .find(|(_, msg)| self.can_deliver(msg.sender, &msg.clock))
            .map(|(&id, _)| id)
    }

    pub fn can_deliver(&self, sender: NodeId, clock: &VectorClock) -> bool {
        self.clock.entries().iter()
            .zip(clock.entries())
            .enumerate()
            .all(|(i, (&local, &remote))| {
                if i == sender.index() {
                    remote == local + 1
                }
                else {
                    remote <= local
                }
            })
    }

    fn missing_predecessors(&self, sender: NodeId, clock: &VectorClock) -> Vec<MissingPredecessor> {
        self.clock.entries().iter()
            .zip(clock.entries())
            .enumerate()
            .filter_map(|(i, (&local, &remote))| {
                let required = if i == sender.index() { remote.saturating_sub(1) } else { remote };
                (required > local).then(|| MissingPredecessor::Broadcasts {
                    from: NodeId(i),
                    count: required - local,
                })
            })
            .collect()
    }

    pub fn num_buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Buffered messages that have been waiting for at least `timeout`. Each message is
    ///  returned only once, but it stays buffered.
    pub fn take_newly_stalled(&mut self, now: Instant, timeout: Duration) -> Vec<StalledMessage> {
        let newly_stalled = self.buffer.iter()
            .filter(|(_, msg)| !msg.stall_reported && now.saturating_duration_since(msg.received_at) >= timeout)
            .map(|(&id, msg)| StalledMessage {
                id,
                sender: msg.sender,
                mode: DeliveryMode::Broadcast,
                waited: now.saturating_duration_since(msg.received_at),
                missing: self.missing_predecessors(msg.sender, &msg.clock),
            })
            .collect::<Vec<_>>();

        for stalled in &newly_stalled {
            if let Some(msg) = self.buffer.get_mut(&stalled.id) {
                msg.stall_reported = true;
            }
        }
        newly_stalled
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

    fn clock(entries: &[u64]) -> VectorClock {
        VectorClock::from(entries.to_vec())
    }

    fn contents(delivered: &[Delivery]) -> Vec<&str> {
        delivered.iter()
            .map(|d| d.content.as_str())
            .collect()
    }

    #[rstest]
    #[case::next_from_sender(&[0, 0, 0], 0, &[1, 0, 0], true)]
    #[case::skips_from_sender(&[0, 0, 0], 0, &[2, 0, 0], false)]
    #[case::old_from_sender(&[1, 0, 0], 0, &[1, 0, 0], false)]
    #[case::dependency_satisfied(&[1, 0, 0], 1, &[1, 1, 0], true)]
    #[case::dependency_missing(&[0, 0, 0], 1, &[1, 1, 0], false)]
    #[case::local_ahead(&[3, 2, 5], 1, &[1, 3, 0], true)]
    fn test_can_deliver(#[case] local: &[u64], #[case] sender: usize, #[case] remote: &[u64], #[case] expected: bool) {
        let mut engine = CausalEngine::new(NodeId(2), 3);
        engine.clock = clock(local);
        assert_eq!(engine.can_deliver(NodeId(sender), &clock(remote)), expected);
    }

    #[test]
    fn test_next_broadcast_clock() {
        let mut engine = CausalEngine::new(NodeId(1), 3);
        assert_eq!(engine.next_broadcast_clock(), clock(&[0, 1, 0]));
        let second = engine.next_broadcast_clock();
        assert_eq!(second, clock(&[0, 2, 0]));
        assert_eq!(engine.clock(), &second);
    }

    #[test]
    fn test_three_node_scenario() {
        // node 1 delivers node 0's broadcast, then broadcasts itself - node 2 receives that first
        let mut node1 = CausalEngine::new(NodeId(1), 3);
        let delivered = node1.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "from 0".into());
        assert_eq!(delivered, vec![Delivery::broadcast(NodeId(0), "from 0")]);
        assert_eq!(node1.clock(), &clock(&[1, 0, 0]));
        let clock_of_reply = node1.next_broadcast_clock();
        assert_eq!(clock_of_reply, clock(&[1, 1, 0]));

        let mut node2 = CausalEngine::new(NodeId(2), 3);
        assert!(node2.handle_message(id(1, 0), NodeId(1), clock_of_reply, "reply from 1".into()).is_empty());
        assert_eq!(node2.num_buffered(), 1);

        let delivered = node2.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "from 0".into());
        assert_eq!(delivered, vec![
            Delivery::broadcast(NodeId(0), "from 0"),
            Delivery::broadcast(NodeId(1), "reply from 1"),
        ]);
        assert_eq!(node2.clock(), &clock(&[1, 1, 0]));
        assert_eq!(node2.num_buffered(), 0);
    }

    #[test]
    fn test_cascading_release_of_chain() {
        // m1 (from 0) -> m2 (from 1, saw m1) -> m3 (from 2, saw m2), arriving as m3, m2, m1
        let mut engine = CausalEngine::new(NodeId(3), 4);

        assert!(engine.handle_message(id(2, 0), NodeId(2), clock(&[1, 1, 1, 0]), "m3".into()).is_empty());
        assert!(engine.handle_message(id(1, 0), NodeId(1), clock(&[1, 1, 0, 0]), "m2".into()).is_empty());
        let delivered = engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0, 0]), "m1".into());

        assert_eq!(contents(&delivered), vec!["m1", "m2", "m3"]);
        assert_eq!(engine.clock(), &clock(&[1, 1, 1, 0]));
        assert_eq!(engine.num_buffered(), 0);
    }

    #[test]
    fn test_concurrent_messages_are_both_delivered() {
        let mut engine = CausalEngine::new(NodeId(2), 3);
        assert_eq!(contents(&engine.handle_message(id(1, 0), NodeId(1), clock(&[0, 1, 0]), "b".into())), vec!["b"]);
        assert_eq!(contents(&engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "a".into())), vec!["a"]);
        assert_eq!(engine.clock(), &clock(&[1, 1, 0]));
    }

    /// a -> b -> c -> e is a causal chain across nodes 0 and 1, d (from node 2) is concurrent to all
    const HISTORY: [(&str, usize, u64, [u64; 4]); 5] = [
        ("a", 0, 0, [1, 0, 0, 0]),
        ("b", 1, 0, [1, 1, 0, 0]),
        ("c", 0, 1, [2, 1, 0, 0]),
        ("d", 2, 0, [0, 0, 1, 0]),
        ("e", 1, 1, [2, 2, 0, 0]),
    ];

    fn happened_before(x: &[u64; 4], y: &[u64; 4]) -> bool {
        x != y && x.iter().zip(y.iter()).all(|(a, b)| a <= b)
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3, 4])]
    #[case::reversed(vec![4, 3, 2, 1, 0])]
    #[case::shuffled(vec![2, 4, 3, 0, 1])]
    #[case::concurrent_last(vec![1, 0, 4, 2, 3])]
    #[case::with_duplicates(vec![4, 1, 4, 3, 0, 2, 1, 0, 3, 2])]
    fn test_any_arrival_order_respects_happened_before(#[case] arrivals: Vec<usize>) {
        let mut engine = CausalEngine::new(NodeId(3), 4);
        let mut delivered = Vec::new();
        for i in arrivals {
            let (content, sender, counter, entries) = HISTORY[i];
            delivered.extend(engine.handle_message(id(sender, counter), NodeId(sender), clock(&entries), content.into()));
        }

        let delivered = contents(&delivered);
        assert_eq!(delivered.len(), HISTORY.len());

        let position = |content: &str| delivered.iter().position(|&d| d == content).unwrap();
        for (x, _, _, clock_x) in &HISTORY {
            for (y, _, _, clock_y) in &HISTORY {
                if happened_before(clock_x, clock_y) {
                    assert!(position(*x) < position(*y), "{} must be delivered before {}: {:?}", x, y, delivered);
                }
            }
        }
        assert_eq!(engine.clock(), &clock(&[2, 2, 1, 0]));
        assert_eq!(engine.num_buffered(), 0);
    }

    #[test]
    fn test_duplicates() {
        let mut engine = CausalEngine::new(NodeId(2), 3);

        // duplicate of a buffered message
        assert!(engine.handle_message(id(0, 1), NodeId(0), clock(&[2, 0, 0]), "second".into()).is_empty());
        assert!(engine.handle_message(id(0, 1), NodeId(0), clock(&[2, 0, 0]), "second".into()).is_empty());
        assert_eq!(engine.num_buffered(), 1);

        assert_eq!(contents(&engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "first".into())), vec!["first", "second"]);

        // duplicate of a delivered message
        assert!(engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "first".into()).is_empty());
        assert_eq!(engine.clock(), &clock(&[2, 0, 0]));
    }

    #[test]
    fn test_superseded_message_is_dropped() {
        let mut engine = CausalEngine::new(NodeId(2), 3);
        engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0, 0]), "first".into());

        assert!(engine.handle_message(id(0, 5), NodeId(0), clock(&[1, 0, 0]), "again".into()).is_empty());
        assert_eq!(engine.num_buffered(), 0);
    }

    #[test]
    fn test_wrong_clock_size_is_dropped() {
        let mut engine = CausalEngine::new(NodeId(2), 3);
        assert!(engine.handle_message(id(0, 0), NodeId(0), clock(&[1, 0]), "x".into()).is_empty());
        assert_eq!(engine.num_buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_newly_stalled() {
        let mut engine = CausalEngine::new(NodeId(2), 3);
        engine.handle_message(id(1, 4), NodeId(1), clock(&[2, 3, 0]), "waiting".into());

        assert!(engine.take_newly_stalled(Instant::now(), Duration::from_secs(10)).is_empty());
        time::advance(Duration::from_secs(10)).await;

        let stalled = engine.take_newly_stalled(Instant::now(), Duration::from_secs(10));
        assert_eq!(stalled, vec![StalledMessage {
            id: id(1, 4),
            sender: NodeId(1),
            mode: DeliveryMode::Broadcast,
            waited: Duration::from_secs(10),
            missing: vec![
                MissingPredecessor::Broadcasts { from: NodeId(0), count: 2 },
                MissingPredecessor::Broadcasts { from: NodeId(1), count: 2 },
            ],
        }]);
        assert!(engine.take_newly_stalled(Instant::now(), Duration::from_secs(10)).is_empty());
        assert_eq!(engine.num_buffered(), 1);
    }
}
