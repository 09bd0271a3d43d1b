use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};


/// A node's position in the (fixed) participant list. It doubles as the node's dimension in
///  vector clocks, so it is always a valid index into a clock of the cluster's size.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        NodeId(value)
    }
}


/// Identifies a message globally: the originating node plus a counter that only ever increases
///  on that node. On the wire it is rendered as `"<sender>-<counter>"`.
///
/// NB: The counter is for uniqueness only. Ordering of private messages is based on a separate
///      sequence number, and ordering of broadcasts on vector clocks.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId {
    pub sender: NodeId,
    pub counter: u64,
}

impl MessageId {
    pub fn new(sender: NodeId, counter: u64) -> MessageId {
        MessageId { sender, counter }
    }
}

impl Debug for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.sender.0, self.counter)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.sender.0, self.counter)
    }
}

impl FromStr for MessageId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sender, counter) = s.split_once('-')
            .ok_or_else(|| anyhow!("message id {:?} is not of the form <sender>-<counter>", s))?;

        Ok(MessageId {
            sender: NodeId(sender.parse()?),
            counter: counter.parse()?,
        })
    }
}

impl TryFrom<String> for MessageId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MessageId> for String {
    fn from(value: MessageId) -> Self {
        value.to_string()
    }
}
