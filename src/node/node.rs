use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::messaging::delivery_events::{DeliveryEvent, DeliveryEventNotifier};
use crate::messaging::node_id::{MessageId, NodeId};
use crate::messaging::packet::MessagePacket;
use crate::messaging::transport::{MessageHandler, ReliableTransport};
use crate::node::node_config::NodeConfig;
use crate::ordering::causal::CausalEngine;
use crate::ordering::fifo::FifoEngine;
use crate::ordering::{Delivery, DeliveryMode};


/// The application's callback for delivered messages. It is called once per delivered message,
///  in delivery order, from the node's receive loop - so it should return quickly.
#[cfg_attr(test, automock)]
pub trait DeliveryListener: Send + Sync + 'static {
    fn on_delivered(&self, delivery: Delivery);
}

impl <F: Fn(Delivery) + Send + Sync + 'static> DeliveryListener for F {
    fn on_delivered(&self, delivery: Delivery) {
        self(delivery)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    /// to all other participants, delivered in causal order
    Broadcast,
    /// to a single other participant, delivered in FIFO order
    Private(NodeId),
}

/// FIFO and causal order are independent ordering domains: private messages carry no causal
///  dependencies on broadcasts, and vice versa.
struct OrderingEngines {
    fifo: FifoEngine,
    causal: CausalEngine,
}

enum NodeState {
    Created,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// A participant in the messaging cluster: it binds the reliable transport to the two delivery
///  engines, routing each received message to one of them based on its mode.
pub struct Node {
    config: Arc<NodeConfig>,
    transport: Arc<ReliableTransport>,
    engines: Arc<Mutex<OrderingEngines>>,
    listener: Arc<dyn DeliveryListener>,
    events: Arc<DeliveryEventNotifier>,
    state: Mutex<NodeState>,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node{{myself:{}}}", self.config.myself)
    }
}

impl Node {
    /// Binds the node's own participant address. Failing to bind is fatal for the node.
    pub async fn new(config: NodeConfig, listener: Arc<dyn DeliveryListener>) -> anyhow::Result<Node> {
        config.validate()?;
        let self_addr = config.self_addr()?;
        let socket = UdpSocket::bind(self_addr).await
            .with_context(|| format!("node {} cannot bind {:?} - is the address in use?", config.myself, self_addr))?;
        Self::with_socket(config, socket, listener)
    }

    /// Uses a socket that was bound already, e.g. to an ephemeral port
    pub fn with_socket(config: NodeConfig, socket: UdpSocket, listener: Arc<dyn DeliveryListener>) -> anyhow::Result<Node> {
        config.validate()?;

        let events = Arc::new(DeliveryEventNotifier::new());
        let transport = Arc::new(ReliableTransport::new(config.myself, socket, Arc::new(config.transport.clone()), events.clone())?);
        let engines = OrderingEngines {
            fifo: FifoEngine::new(),
            causal: CausalEngine::new(config.myself, config.num_nodes()),
        };

        Ok(Node {
            config: Arc::new(config),
            transport,
            engines: Arc::new(Mutex::new(engines)),
            listener,
            events,
            state: Mutex::new(NodeState::Created),
        })
    }

    pub fn myself(&self) -> NodeId {
        self.config.myself
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Starts receiving. Calling this on a running node has no effect, but a stopped node
    ///  cannot be restarted.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            NodeState::Created => {}
            NodeState::Running(_) => return Ok(()),
            NodeState::Stopped => bail!("node {} was stopped and cannot be restarted", self.config.myself),
        }

        let mut handles = Vec::new();

        let handler = Arc::new(NodeMessageHandler {
            myself: self.config.myself,
            num_nodes: self.config.num_nodes(),
            engines: self.engines.clone(),
            listener: self.listener.clone(),
        });
        let transport = self.transport.clone();
        handles.push(tokio::spawn(async move {
            transport.recv_loop(handler).await
        }));

        if let Some(stall_timeout) = self.config.stall_timeout {
            handles.push(tokio::spawn(run_stall_check(
                self.engines.clone(),
                self.events.clone(),
                stall_timeout,
                self.config.stall_check_interval,
            )));
        }

        *state = NodeState::Running(handles);
        info!("node {} started on {:?}", self.config.myself, self.transport.local_addr()?);
        Ok(())
    }

    /// Stops the node for good. Buffered messages are discarded, outstanding
    ///  retransmissions are abandoned, and the node's address is unbound when this returns.
    pub async fn stop(&self) {
        let prev = std::mem::replace(&mut *self.state.lock().await, NodeState::Stopped);

        self.transport.stop().await;
        if let NodeState::Running(handles) = prev {
            for handle in handles {
                handle.abort();
                // the receive loop holds the socket until it has exited
                let _ = handle.await;
            }
            info!("node {} stopped", self.config.myself);
        }
    }

    pub async fn send(&self, content: impl Into<String>, mode: SendMode) -> anyhow::Result<MessageId> {
        let content = content.into();

        if self.transport.is_stopped() {
            bail!("node {} is stopped", self.config.myself);
        }

        match mode {
            SendMode::Broadcast => {
                let clock = self.engines.lock().await
                    .causal
                    .next_broadcast_clock();
                debug!("broadcasting with clock {:?}", clock);
                self.transport.send_broadcast(clock, content, &self.config.other_nodes()).await
            }
            SendMode::Private(target) => {
                if target == self.config.myself {
                    bail!("node {} cannot send a private message to itself", target);
                }
                let to = self.config.addr_of(target)
                    .ok_or_else(|| anyhow!("there is no node {} - there are {} nodes", target, self.config.num_nodes()))?;
                self.transport.send_private(target, to, content).await
            }
        }
    }
}


struct NodeMessageHandler {
    myself: NodeId,
    num_nodes: usize,
    engines: Arc<Mutex<OrderingEngines>>,
    listener: Arc<dyn DeliveryListener>,
}

#[async_trait]
impl MessageHandler for NodeMessageHandler {
    async fn handle_message(&self, packet: MessagePacket, sender: SocketAddr) -> anyhow::Result<()> {
        packet.validate(self.myself, self.num_nodes)?;
        trace!("received {:?} message {} from node {} at {:?}", packet.mode, packet.id, packet.sender_id, sender);

        let MessagePacket { mode, id, sender_id, clock, content, seq_num, .. } = packet;

        let delivered = {
            let mut engines = self.engines.lock().await;
            match mode {
                DeliveryMode::Private => {
                    let seq_num = seq_num.ok_or_else(|| anyhow!("private message without a sequence number"))?;
                    engines.fifo.handle_message(id, sender_id, content, seq_num)
                }
                DeliveryMode::Broadcast => {
                    let clock = clock.ok_or_else(|| anyhow!("broadcast without a vector clock"))?;
                    engines.causal.handle_message(id, sender_id, clock, content)
                }
            }
        };

        // the listener is called outside the lock, but still from the receive loop, so the order
        //  is preserved
        for delivery in delivered {
            debug!("delivering {:?} message from node {}", delivery.mode, delivery.sender);
            self.listener.on_delivered(delivery);
        }
        Ok(())
    }
}

async fn run_stall_check(engines: Arc<Mutex<OrderingEngines>>, events: Arc<DeliveryEventNotifier>, stall_timeout: Duration, check_interval: Duration) {
    let mut ticks = time::interval(check_interval);
    loop {
        ticks.tick().await;

        let stalled = {
            let mut engines = engines.lock().await;
            let now = Instant::now();
            let mut stalled = engines.fifo.take_newly_stalled(now, stall_timeout);
            stalled.extend(engines.causal.take_newly_stalled(now, stall_timeout));
            stalled
        };

        for msg in stalled {
            warn!("{:?} message {} from node {} has been waiting for {:?} for {:?} - it may never become deliverable", msg.mode, msg.id, msg.sender, msg.missing, msg.waited);
            events.send_event(DeliveryEvent::DependencyUnresolved(msg));
        }
    }
}
