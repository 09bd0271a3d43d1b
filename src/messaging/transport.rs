use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use crate::messaging::ack_tracker::AckTracker;
use crate::messaging::delivery_events::{DeliveryEvent, DeliveryEventNotifier, NotAcknowledgedData};
use crate::messaging::node_id::{MessageId, NodeId};
use crate::messaging::packet::{AckPacket, MessagePacket, Packet};
use crate::messaging::transport_config::{RetryPolicy, TransportConfig};
use crate::ordering::vector_clock::VectorClock;
use crate::ordering::DeliveryMode;


/// This trait decouples the transport from what happens to a message once it is received.
///
/// It is called from the receive loop, one packet at a time, so implementations see a
///  serialized sequence of messages and need no further coordination among themselves.
#[async_trait]
pub trait MessageHandler: Sync + Send {
    /// Called for every MESSAGE packet, including duplicates. The packet is acknowledged
    ///  afterwards if this returns `Ok`, and dropped silently otherwise.
    async fn handle_message(&self, packet: MessagePacket, sender: SocketAddr) -> anyhow::Result<()>;
}


/// At-least-once messaging on top of UDP.
///
/// Every message packet is acknowledged by its receiver, and the sender re-sends it to each
///  recipient independently until that recipient acknowledges or the retry budget for the
///  message's mode is exhausted. Duplicates are expected on the receiving side and must be
///  filtered there.
///
/// Acknowledgements go back to the address a packet came from, so a single socket is used for
///  sending and receiving. Stopping the transport releases the socket.
pub struct ReliableTransport {
    config: Arc<TransportConfig>,
    myself: NodeId,
    local_addr: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    message_counter: AtomicU64,
    sequence_numbers: RwLock<FxHashMap<NodeId, AtomicU64>>,
    acks: Arc<AckTracker>,
    events: Arc<DeliveryEventNotifier>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl Debug for ReliableTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReliableTransport{{myself:{:?}}}", self.myself)
    }
}

impl ReliableTransport {
    pub async fn bind(myself: NodeId, addr: SocketAddr, config: Arc<TransportConfig>, events: Arc<DeliveryEventNotifier>) -> anyhow::Result<ReliableTransport> {
        let socket = UdpSocket::bind(addr).await
            .with_context(|| format!("error binding UDP socket for node {} to {:?}", myself, addr))?;
        Self::new(myself, socket, config, events)
    }

    pub fn new(myself: NodeId, socket: UdpSocket, config: Arc<TransportConfig>, events: Arc<DeliveryEventNotifier>) -> anyhow::Result<ReliableTransport> {
        let (shutdown, _) = watch::channel(false);

        Ok(ReliableTransport {
            config,
            myself,
            local_addr: socket.local_addr()?,
            socket: RwLock::new(Some(Arc::new(socket))),
            message_counter: AtomicU64::new(0),
            sequence_numbers: Default::default(),
            acks: Arc::new(AckTracker::new()),
            events,
            tasks: Default::default(),
            shutdown,
        })
    }

    /// the address the transport was bound to, which stays available after stopping
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn socket(&self) -> anyhow::Result<Arc<UdpSocket>> {
        match self.socket.read().await.as_ref() {
            Some(socket) => Ok(socket.clone()),
            None => bail!("transport is stopped"),
        }
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::new(self.myself, self.message_counter.fetch_add(1, Ordering::AcqRel))
    }

    /// Private sequence numbers are counted per target: the target's FIFO engine only sees
    ///  the messages addressed to it, and they must be numbered without gaps.
    async fn next_sequence_number(&self, target: NodeId) -> u64 {
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(atomic_counter) = self.sequence_numbers.read().await
                .get(&target)
            {
                return atomic_counter.fetch_add(1, Ordering::AcqRel);
            }
        }

        let mut sequence_numbers = self.sequence_numbers.write().await;
        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(atomic_counter) = sequence_numbers.get(&target) {
            return atomic_counter.fetch_add(1, Ordering::AcqRel);
        }

        sequence_numbers.insert(target, AtomicU64::new(1));
        0
    }

    /// `clock` must already count this broadcast, and it must not be modified afterwards
    pub async fn send_broadcast(&self, clock: VectorClock, content: String, recipients: &[SocketAddr]) -> anyhow::Result<MessageId> {
        let id = self.next_message_id();
        self.send_message(MessagePacket::broadcast(id, clock, content), recipients).await?;
        Ok(id)
    }

    pub async fn send_private(&self, target: NodeId, to: SocketAddr, content: String) -> anyhow::Result<MessageId> {
        let id = self.next_message_id();
        let seq_num = self.next_sequence_number(target).await;
        self.send_message(MessagePacket::private(id, target, seq_num, content), &[to]).await?;
        Ok(id)
    }

    async fn send_message(&self, packet: MessagePacket, recipients: &[SocketAddr]) -> anyhow::Result<()> {
        if self.is_stopped() {
            bail!("transport is stopped");
        }
        let socket = self.socket().await?;

        let id = packet.id;
        let mode = packet.mode;
        let payload = Bytes::from(Packet::Message(packet).ser()?);
        let retry_policy = self.config.retry_policy(mode);

        if mode == DeliveryMode::Broadcast {
            self.acks.start_broadcast(id, recipients).await;
        }

        for &to in recipients {
            trace!("sending {:?} message {} to {:?}", mode, id, to);
            self.acks.expect_ack(id, to).await;

            // a failed send is just another lost packet: the retransmission takes care of it
            if let Err(e) = socket.send_to(&payload, to).await {
                error!("error sending message {} to {:?}: {}", id, to, e);
            }

            let retransmission = self.retransmitter(&socket).watch_for_ack(id, mode, payload.clone(), to, retry_policy);
            self.spawn_task(retransmission).await;
        }

        if mode == DeliveryMode::Broadcast {
            let report = self.retransmitter(&socket).report_broadcast(id, self.config.broadcast_observation_window);
            self.spawn_task(report).await;
        }
        Ok(())
    }

    fn retransmitter(&self, socket: &Arc<UdpSocket>) -> Retransmitter {
        Retransmitter {
            socket: socket.clone(),
            acks: self.acks.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.subscribe(),
        }
    }

    async fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}

        if !self.is_stopped() {
            tasks.spawn(task);
        }
    }

    /// Receives and dispatches packets until the transport is stopped. Packets are handled
    ///  one at a time.
    pub async fn recv_loop(&self, handler: Arc<dyn MessageHandler>) {
        let mut shutdown = self.shutdown.subscribe();
        let Ok(socket) = self.socket().await else {
            return;
        };

        let mut buf = BytesMut::with_capacity(self.config.max_datagram_size);
        loop {
            buf.clear();
            select! {
                _ = async { let _ = shutdown.wait_for(|&stopped| stopped).await; } => {
                    info!("shutting down receive loop for node {}", self.myself);
                    return;
                }
                result = socket.recv_buf_from(&mut buf) => {
                    match result {
                        Ok((num_read, from)) => {
                            trace!("received datagram from {:?}, len {}", from, num_read);
                            self.on_datagram(&socket, &buf, from, handler.as_ref()).await;
                        }
                        Err(e) => {
                            error!("error receiving datagram: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn on_datagram(&self, socket: &UdpSocket, buf: &[u8], from: SocketAddr, handler: &dyn MessageHandler) {
        match Packet::try_deser(buf) {
            Ok(Packet::Message(packet)) => {
                let id = packet.id;
                match handler.handle_message(packet, from).await {
                    Ok(()) => send_ack(socket, id, from).await,
                    Err(e) => warn!("dropping message {} from {:?}: {}", id, from, e),
                }
            }
            Ok(Packet::Ack(ack)) => {
                if self.acks.record_ack(ack.ack_id, from).await {
                    trace!("message {} acknowledged by {:?}", ack.ack_id, from);
                }
            }
            Err(e) => {
                warn!("received unparseable datagram from {:?} - dropping: {}", from, e);
            }
        }
    }

    /// Stops the receive loop and all retransmission and reporting tasks, and releases the
    ///  socket. The port is unbound once the receive loop has exited. Stopping is final.
    pub async fn stop(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        debug!("stopping transport for node {}", self.myself);

        self.tasks.lock().await
            .shutdown().await;
        self.socket.write().await
            .take();
    }
}

async fn send_ack(socket: &UdpSocket, id: MessageId, to: SocketAddr) {
    let ack = match Packet::Ack(AckPacket { ack_id: id }).ser() {
        Ok(ack) => ack,
        Err(e) => {
            error!("error serializing ack for {}: {}", id, e);
            return;
        }
    };

    if let Err(e) = socket.send_to(&ack, to).await {
        error!("error sending ack for {} to {:?}: {}", id, to, e);
    }
}


/// The parts of the transport that background tasks need
struct Retransmitter {
    socket: Arc<UdpSocket>,
    acks: Arc<AckTracker>,
    events: Arc<DeliveryEventNotifier>,
    shutdown: watch::Receiver<bool>,
}

impl Retransmitter {
    /// returns `false` if the transport was stopped while sleeping
    async fn sleep(&mut self, duration: Duration) -> bool {
        select! {
            _ = time::sleep(duration) => true,
            _ = self.shutdown.wait_for(|&stopped| stopped) => false,
        }
    }

    async fn watch_for_ack(mut self, id: MessageId, mode: DeliveryMode, payload: Bytes, to: SocketAddr, policy: RetryPolicy) {
        for attempt in 0..=policy.max_retries {
            if !self.sleep(policy.interval).await {
                self.acks.finish(id, to).await;
                return;
            }
            if self.acks.is_acked(id, to).await {
                self.acks.finish(id, to).await;
                return;
            }
            if attempt == policy.max_retries {
                break;
            }

            debug!("no ack for message {} from {:?} - re-sending ({}/{})", id, to, attempt + 1, policy.max_retries);
            if let Err(e) = self.socket.send_to(&payload, to).await {
                error!("error re-sending message {} to {:?}: {}", id, to, e);
            }
        }

        if self.acks.finish(id, to).await {
            // the ack arrived just now
            return;
        }

        match mode {
            DeliveryMode::Broadcast => warn!("node at {:?} did not respond to broadcast {} (may be offline)", to, id),
            DeliveryMode::Private => warn!("private message {} not acknowledged by {:?} after {} retries", id, to, policy.max_retries),
        }
        self.events.send_event(DeliveryEvent::NotAcknowledged(NotAcknowledgedData {
            id,
            recipient: to,
            mode,
            num_retries: policy.max_retries,
        }));
    }

    async fn report_broadcast(mut self, id: MessageId, observation_window: Duration) {
        let completed = self.sleep(observation_window).await;

        let Some(completion) = self.acks.finish_broadcast(id).await else {
            return;
        };
        if !completed {
            return;
        }

        if completion.is_complete() {
            info!("broadcast {} delivered to {}", id, completion);
        }
        else {
            warn!("broadcast {} delivered to {}", id, completion);
        }
        self.events.send_event(DeliveryEvent::BroadcastCompleted(completion));
    }
}
