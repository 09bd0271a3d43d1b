use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;

use crate::messaging::node_id::MessageId;
use crate::ordering::{DeliveryMode, StalledMessage};

/// Diagnostics for the operator. None of these affect ordering guarantees: the engines work
///  purely on received messages, regardless of whether this node's own sends got through.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryEvent {
    /// emitted once per broadcast, after the observation window
    BroadcastCompleted(BroadcastCompletion),
    /// a recipient did not acknowledge a message after all retries
    NotAcknowledged(NotAcknowledgedData),
    /// a buffered message waited longer than the stall timeout for its predecessors
    DependencyUnresolved(StalledMessage),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BroadcastCompletion {
    pub id: MessageId,
    pub acknowledged: usize,
    pub expected: usize,
}

impl BroadcastCompletion {
    pub fn is_complete(&self) -> bool {
        self.acknowledged >= self.expected
    }
}

impl Display for BroadcastCompletion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} nodes", self.acknowledged, self.expected)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotAcknowledgedData {
    pub id: MessageId,
    pub recipient: SocketAddr,
    pub mode: DeliveryMode,
    pub num_retries: u32,
}


pub struct DeliveryEventNotifier {
    sender: broadcast::Sender<DeliveryEvent>,
}
impl Default for DeliveryEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryEventNotifier {
    pub fn new() -> DeliveryEventNotifier {
        let (sender, _) = broadcast::channel(128);

        DeliveryEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: DeliveryEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
