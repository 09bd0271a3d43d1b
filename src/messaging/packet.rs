use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::messaging::node_id::{MessageId, NodeId};
use crate::ordering::vector_clock::VectorClock;
use crate::ordering::DeliveryMode;

/// The unit of transfer: exactly one packet per UDP datagram, encoded as a JSON object with a
///  `type` discriminator.
///
/// ```ascii
/// {"type":"MESSAGE","mode":"broadcast","id":"0-0","sender_id":0,"target_id":null,"clock":[1,0,0],"content":"hi"}
/// {"type":"MESSAGE","mode":"private","id":"0-1","sender_id":0,"target_id":2,"clock":null,"content":"psst","seq_num":0}
/// {"type":"ACK","ack_id":"0-1"}
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "MESSAGE")]
    Message(MessagePacket),
    #[serde(rename = "ACK")]
    Ack(AckPacket),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    pub mode: DeliveryMode,
    pub id: MessageId,
    pub sender_id: NodeId,
    /// only for private messages
    pub target_id: Option<NodeId>,
    /// only for broadcasts
    pub clock: Option<VectorClock>,
    pub content: String,
    /// only for private messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq_num: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AckPacket {
    pub ack_id: MessageId,
}

impl Packet {
    pub fn ser(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn try_deser(buf: &[u8]) -> anyhow::Result<Packet> {
        Ok(serde_json::from_slice(buf)?)
    }
}

impl MessagePacket {
    pub fn broadcast(id: MessageId, clock: VectorClock, content: String) -> MessagePacket {
        MessagePacket {
            mode: DeliveryMode::Broadcast,
            id,
            sender_id: id.sender,
            target_id: None,
            clock: Some(clock),
            content,
            seq_num: None,
        }
    }

    pub fn private(id: MessageId, target: NodeId, seq_num: u64, content: String) -> MessagePacket {
        MessagePacket {
            mode: DeliveryMode::Private,
            id,
            sender_id: id.sender,
            target_id: Some(target),
            clock: None,
            content,
            seq_num: Some(seq_num),
        }
    }

    /// Checks the mode specific fields for a cluster of `num_nodes` nodes, as seen by the
    ///  receiving node `myself`
    pub fn validate(&self, myself: NodeId, num_nodes: usize) -> anyhow::Result<()> {
        if self.sender_id.index() >= num_nodes {
            bail!("sender {:?} is not a participant - there are {} nodes", self.sender_id, num_nodes);
        }

        match self.mode {
            DeliveryMode::Broadcast => {
                let clock = self.clock.as_ref()
                    .ok_or_else(|| anyhow!("broadcast without a vector clock"))?;
                if clock.len() != num_nodes {
                    bail!("vector clock {:?} has {} entries, expected {}", clock, clock.len(), num_nodes);
                }
            }
            DeliveryMode::Private => {
                if self.seq_num.is_none() {
                    bail!("private message without a sequence number");
                }
                if let Some(target) = self.target_id {
                    if target != myself {
                        bail!("private message is addressed to {:?}", target);
                    }
                }
            }
        }
        Ok(())
    }
}
