//! The delivery-ordering engines: they decide when a received message may be handed to the
//!  application, and buffer it until then.
//!
//! Both engines are plain synchronous state machines. They are driven by a node's (single,
//!  serialized) receive loop, and they know nothing about the network.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messaging::node_id::{MessageId, NodeId};

pub mod vector_clock;
pub mod fifo;
pub mod causal;


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// sent to all other nodes, delivered in causal order
    Broadcast,
    /// sent to a single node, delivered in FIFO order per sender
    Private,
}

/// A message that was released by one of the engines and is ready for the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Delivery {
    pub sender: NodeId,
    pub mode: DeliveryMode,
    pub content: String,
}

impl Delivery {
    pub fn broadcast(sender: NodeId, content: impl Into<String>) -> Delivery {
        Delivery { sender, mode: DeliveryMode::Broadcast, content: content.into() }
    }

    pub fn private(sender: NodeId, content: impl Into<String>) -> Delivery {
        Delivery { sender, mode: DeliveryMode::Private, content: content.into() }
    }
}

impl Display for Delivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.mode {
            DeliveryMode::Broadcast => write!(f, "[BROADCAST from Node {}]: {}", self.sender, self.content),
            DeliveryMode::Private => write!(f, "[MP from Node {}]: {}", self.sender, self.content),
        }
    }
}

/// What a buffered message is still waiting for
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MissingPredecessor {
    /// the private message with this sequence number from the same sender
    SequenceNumber(u64),
    /// this many more broadcasts originated by `from`
    Broadcasts { from: NodeId, count: u64 },
}

/// A buffered message that has waited for its ordering precondition longer than the configured
///  stall timeout. It stays buffered - this is a report, not an eviction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StalledMessage {
    pub id: MessageId,
    pub sender: NodeId,
    pub mode: DeliveryMode,
    pub waited: Duration,
    pub missing: Vec<MissingPredecessor>,
}
