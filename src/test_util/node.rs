use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::messaging::node_id::NodeId;
use crate::messaging::transport_config::{RetryPolicy, TransportConfig};
use crate::node::node::{DeliveryListener, Node};
use crate::node::node_config::NodeConfig;
use crate::ordering::Delivery;
use crate::test_util::bind_localhost;


/// A [DeliveryListener] that forwards deliveries to a channel, for tests to receive them
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<Delivery>,
}
impl ChannelListener {
    pub fn new() -> (ChannelListener, mpsc::UnboundedReceiver<Delivery>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelListener { sender }, receiver)
    }
}
impl DeliveryListener for ChannelListener {
    fn on_delivered(&self, delivery: Delivery) {
        let _ = self.sender.send(delivery);
    }
}

pub struct TestNode {
    pub node: Node,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}
impl TestNode {
    /// waits for the next delivery, giving up after a generous timeout
    pub async fn next_delivery(&mut self) -> Option<Delivery> {
        timeout(Duration::from_secs(5), self.deliveries.recv()).await
            .ok()
            .flatten()
    }

    pub fn try_next_delivery(&mut self) -> Option<Delivery> {
        self.deliveries.try_recv().ok()
    }
}

/// a config with short retry intervals, suitable for tests on localhost
pub fn fast_node_config(myself: NodeId, participants: Vec<SocketAddr>) -> NodeConfig {
    let mut config = NodeConfig::new(myself, participants);
    config.transport = TransportConfig {
        broadcast_retry: RetryPolicy { interval: Duration::from_millis(50), max_retries: 2 },
        private_retry: RetryPolicy { interval: Duration::from_millis(50), max_retries: 3 },
        broadcast_observation_window: Duration::from_millis(300),
        ..TransportConfig::default()
    };
    config
}

/// Starts `num_nodes` nodes on ephemeral localhost ports, with [fast_node_config] modified by
///  `adjust_config`.
pub async fn start_local_cluster(num_nodes: usize, adjust_config: impl Fn(&mut NodeConfig)) -> anyhow::Result<Vec<TestNode>> {
    let sockets = bind_localhost(num_nodes).await?;
    let participants = sockets.iter()
        .map(|s| s.local_addr())
        .collect::<Result<Vec<_>, _>>()?;

    let mut result = Vec::with_capacity(num_nodes);
    for (i, socket) in sockets.into_iter().enumerate() {
        let mut config = fast_node_config(NodeId(i), participants.clone());
        adjust_config(&mut config);

        let (listener, deliveries) = ChannelListener::new();
        let node = Node::with_socket(config, socket, Arc::new(listener))?;
        node.start().await?;
        result.push(TestNode { node, deliveries });
    }
    Ok(result)
}
