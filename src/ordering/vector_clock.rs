use std::fmt::{Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::messaging::node_id::NodeId;

/// Entry `i` counts the broadcasts originated by node `i` that are part of the holder's causal
///  history. The size is fixed to the number of participants when the clock is created.
#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(Vec<u64>);

impl VectorClock {
    pub fn new(num_nodes: usize) -> VectorClock {
        VectorClock(vec![0; num_nodes])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, node: NodeId) -> u64 {
        self.0[node.index()]
    }

    pub fn entries(&self) -> &[u64] {
        &self.0
    }

    /// count one more message originated by `node` - done by a node for its own entry before it
    ///  sends a broadcast
    pub fn increment(&mut self, node: NodeId) {
        self.0[node.index()] += 1;
    }

    /// entrywise maximum, absorbing another clock's causal history into this one
    pub fn merge(&mut self, other: &VectorClock) {
        debug_assert_eq!(self.len(), other.len());
        for (mine, &theirs) in self.0.iter_mut().zip(other.0.iter()) {
            *mine = (*mine).max(theirs);
        }
    }

    /// A copy that is decoupled from later changes to this clock, for stamping an outgoing
    ///  packet
    pub fn snapshot(&self) -> VectorClock {
        self.clone()
    }
}

impl From<Vec<u64>> for VectorClock {
    fn from(value: Vec<u64>) -> Self {
        VectorClock(value)
    }
}

impl Debug for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}
