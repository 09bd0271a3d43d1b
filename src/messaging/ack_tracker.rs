use std::net::SocketAddr;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tracing::trace;

use crate::messaging::delivery_events::BroadcastCompletion;
use crate::messaging::node_id::MessageId;


struct BroadcastRecord {
    recipients: FxHashSet<SocketAddr>,
    acknowledged_by: FxHashSet<SocketAddr>,
}

#[derive(Default)]
struct AckTrackerInner {
    /// outstanding (message, recipient) pairs, with a flag whether they were acknowledged
    pending: FxHashMap<(MessageId, SocketAddr), bool>,
    broadcasts: FxHashMap<MessageId, BroadcastRecord>,
}

/// Acknowledgement bookkeeping shared between the receive loop (which records acks) and the
///  retransmission and reporting tasks (which poll and finalize them).
///
/// Acks are attributed to the (message, sender address) pair, and acks for pairs that are not
///  outstanding are ignored, so the state is bounded by the number of sends in flight.
#[derive(Default)]
pub struct AckTracker {
    inner: Mutex<AckTrackerInner>,
}

impl AckTracker {
    pub fn new() -> AckTracker {
        Default::default()
    }

    /// registers a send that is waiting for an acknowledgement
    pub async fn expect_ack(&self, id: MessageId, recipient: SocketAddr) {
        self.inner.lock().await
            .pending
            .insert((id, recipient), false);
    }

    pub async fn start_broadcast(&self, id: MessageId, recipients: &[SocketAddr]) {
        self.inner.lock().await
            .broadcasts
            .insert(id, BroadcastRecord {
                recipients: recipients.iter().cloned().collect(),
                acknowledged_by: Default::default(),
            });
    }

    /// returns `true` if this was the first acknowledgement for an outstanding send
    pub async fn record_ack(&self, id: MessageId, from: SocketAddr) -> bool {
        let mut inner = self.inner.lock().await;

        if let Some(record) = inner.broadcasts.get_mut(&id) {
            if record.recipients.contains(&from) && record.acknowledged_by.insert(from) {
                trace!("broadcast {} acknowledged by {:?}, {}/{}", id, from, record.acknowledged_by.len(), record.recipients.len());
            }
        }

        match inner.pending.get_mut(&(id, from)) {
            Some(acked) => !std::mem::replace(acked, true),
            None => {
                trace!("ignoring ack for {} from {:?} which is not outstanding", id, from);
                false
            }
        }
    }

    pub async fn is_acked(&self, id: MessageId, recipient: SocketAddr) -> bool {
        self.inner.lock().await
            .pending
            .get(&(id, recipient))
            .cloned()
            .unwrap_or(false)
    }

    /// stops tracking a send, returning whether it was acknowledged
    pub async fn finish(&self, id: MessageId, recipient: SocketAddr) -> bool {
        self.inner.lock().await
            .pending
            .remove(&(id, recipient))
            .unwrap_or(false)
    }

    pub async fn finish_broadcast(&self, id: MessageId) -> Option<BroadcastCompletion> {
        self.inner.lock().await
            .broadcasts
            .remove(&id)
            .map(|record| BroadcastCompletion {
                id,
                acknowledged: record.acknowledged_by.len(),
                expected: record.recipients.len(),
            })
    }

    pub async fn num_outstanding(&self) -> usize {
        self.inner.lock().await
            .pending
            .len()
    }
}
