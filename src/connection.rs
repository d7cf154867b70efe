use crate::ack_track::{AckTrackQueue, OutboundAckTrack, PendingAcks, ACK_WINDOW_WIDTH};
use crate::buffer_pool::{DatagramBufferPool, MAX_DATAGRAM_SIZE};
use crate::config::MessagingConfig;
use crate::flow_control::FlowControl;
use crate::fragmentation::{FragmentedReceiveManager, FragmentedSendManager};
use crate::message::{
    msg_id, FragmentInfo, MessageHeader, MessagePool, NetworkMessage, MAX_PRIORITY, RELIABLE_NUMBER_MASK,
};
use crate::message_dispatcher::MessageDispatcher;
use crate::packet_header::PacketHeader;
use crate::packet_id::PacketId;
use crate::queues::{AcceptQueue, DeliveryQueue, InboundMessage, OutboundQueue};
use crate::received_ids::{ReceivedIdWindow, ReliableDuplicateFilter};
use crate::rtt::RttEstimator;
use crate::socket::DatagramSocket;
use crate::stats::{ConnectionStats, StatsContainer};
use crate::timer::PolledTimer;
use crate::vle::{VarLenCoding, Vle8_16, Vle8_16_32};
use anyhow::bail;
use bytes::BufMut;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, span, trace, warn, Level};
use uuid::Uuid;

/// headroom reserved for packet and message headers when deciding whether a message needs
///  fragmentation (an approximate upper bound)
const SEND_HEADER_UPPER_BOUND: usize = 32;

/// duplicate filter sizing for inbound reliable message numbers
const RELIABLE_FILTER_PRUNE_THRESHOLD: usize = 64 * 1024;
const RELIABLE_FILTER_MAX_GAP: u32 = 1 << 20;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// waiting for the first inbound bytes to confirm the peer is there
    Pending,
    Ok,
    /// local disconnect initiated, waiting for the teardown handshake to finish
    Disconnecting,
    /// the peer's read side is gone without a local disconnect
    PeerClosed,
    /// terminal: all further sends are rejected
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum PacketSendResult {
    Ok,
    NoMessages,
    Throttled,
    SocketFull,
    SocketClosed,
}

/// Everything the worker mutates, behind a single lock. Application threads never touch
///  this directly; they go through the accept and delivery queues.
struct ConnectionInner {
    state_tx: watch::Sender<ConnectionState>,
    outbound_queue: OutboundQueue,
    /// newest message number per outbound (message id, content id) slot; the packer drops
    ///  slot members that are not the newest
    content_send_track: FxHashMap<(u32, u32), u64>,
    packet_id_counter: PacketId,
    /// packet id of the last sent datagram that carried in-order messages, the reference
    ///  point for the order delta field
    last_in_order_sent: Option<PacketId>,
    outbound_ack_tracks: AckTrackQueue,
    pending_acks: PendingAcks,
    received_packet_ids: ReceivedIdWindow,
    reliable_duplicates: ReliableDuplicateFilter,
    fragmented_receives: FragmentedReceiveManager,
    /// (packet id, receive time) stamp per inbound (message id, content id) slot
    content_recv_stamps: FxHashMap<(u32, u32), (PacketId, Instant)>,
    flow: FlowControl,
    rtt: RttEstimator,
    last_heard: Instant,
    ping_timer: PolledTimer,
    stats_timer: PolledTimer,
    update_timer: PolledTimer,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state();
        if old_state == new_state {
            return;
        }
        debug!("connection state: {:?} -> {:?}", old_state, new_state);
        self.state_tx.send_replace(new_state);
    }

    fn set_peer_closed(&self) {
        match self.state() {
            ConnectionState::Pending => {
                debug!("peer closed the connection while still pending - tearing down");
                self.set_state(ConnectionState::Closed);
            }
            ConnectionState::Ok => self.set_state(ConnectionState::PeerClosed),
            ConnectionState::Disconnecting => self.set_state(ConnectionState::Closed),
            ConnectionState::PeerClosed | ConnectionState::Closed => {}
        }
    }
}

/// One peer-to-peer connection over an unreliable datagram socket.
///
/// The application enqueues messages from any thread; a [`crate::worker::NetworkWorker`]
///  drives the protocol: packing messages into datagrams, acknowledgement and
///  retransmission, flow control, keepalive and teardown.
pub struct UdpConnection {
    socket: Arc<dyn DatagramSocket>,
    config: Arc<MessagingConfig>,
    inner: Mutex<ConnectionInner>,
    state_rx: watch::Receiver<ConnectionState>,
    accept_queue: AcceptQueue,
    delivery_queue: DeliveryQueue,
    fragmented_sends: StdMutex<FragmentedSendManager>,
    pool: MessagePool,
    buffer_pool: DatagramBufferPool,
    stats: StatsContainer,
    dispatcher: StdMutex<Option<Arc<dyn MessageDispatcher>>>,
    message_number_counter: AtomicU64,
    reliable_number_counter: AtomicU32,
    outbound_sends_paused: AtomicBool,
    worker_wake: StdMutex<Option<Arc<Notify>>>,
}

impl UdpConnection {
    pub fn new(
        socket: Arc<dyn DatagramSocket>,
        config: Arc<MessagingConfig>,
        starting_state: ConnectionState,
    ) -> anyhow::Result<Arc<UdpConnection>> {
        config.validate()?;

        let now = Instant::now();
        let (state_tx, state_rx) = watch::channel(starting_state);

        Ok(Arc::new(UdpConnection {
            socket,
            inner: Mutex::new(ConnectionInner {
                state_tx,
                outbound_queue: OutboundQueue::new(),
                content_send_track: FxHashMap::default(),
                packet_id_counter: PacketId::ZERO,
                last_in_order_sent: None,
                outbound_ack_tracks: AckTrackQueue::new(),
                pending_acks: PendingAcks::new(),
                received_packet_ids: ReceivedIdWindow::new(config.received_id_window),
                reliable_duplicates: ReliableDuplicateFilter::new(
                    RELIABLE_FILTER_PRUNE_THRESHOLD,
                    RELIABLE_FILTER_MAX_GAP,
                ),
                fragmented_receives: FragmentedReceiveManager::new(),
                content_recv_stamps: FxHashMap::default(),
                flow: FlowControl::new(now),
                rtt: RttEstimator::new(),
                last_heard: now,
                ping_timer: PolledTimer::new(),
                stats_timer: PolledTimer::new(),
                update_timer: PolledTimer::new(),
            }),
            state_rx,
            accept_queue: AcceptQueue::new(config.accept_queue_capacity),
            delivery_queue: DeliveryQueue::new(config.inbound_queue_capacity),
            fragmented_sends: StdMutex::new(FragmentedSendManager::new()),
            pool: MessagePool::new(config.message_pool_capacity),
            buffer_pool: DatagramBufferPool::new(MAX_DATAGRAM_SIZE, config.buffer_pool_size),
            stats: StatsContainer::new(),
            dispatcher: StdMutex::new(None),
            message_number_counter: AtomicU64::new(0),
            reliable_number_counter: AtomicU32::new(0),
            outbound_sends_paused: AtomicBool::new(false),
            worker_wake: StdMutex::new(None),
            config,
        }))
    }

    // ---- application-facing API --------------------------------------------------------

    /// Queues one message for sending. Messages larger than the datagram budget are split
    ///  into fragments (and silently upgraded to reliable). Fails for reliable messages
    ///  when the accept queue is full; unreliable messages are dropped silently in that
    ///  case.
    pub async fn send_message(
        &self,
        id: u32,
        reliable: bool,
        in_order: bool,
        priority: u32,
        content_id: u32,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        match self.connection_state() {
            ConnectionState::Closed => bail!("connection is closed"),
            ConnectionState::Disconnecting => bail!("connection is disconnecting"),
            _ => {}
        }
        if msg_id::is_internal(id) {
            bail!("message id {} is reserved for transport-internal messages", id);
        }

        let max_send = self.socket.max_send_size();
        // a message also must not overflow the 11-bit content length of its wire header
        let single_message_budget =
            max_send.min(MessageHeader::MAX_CONTENT_LEN as usize + SEND_HEADER_UPPER_BOUND);

        if payload.len() + SEND_HEADER_UPPER_BOUND > single_message_budget {
            return self.split_and_queue(id, reliable, in_order, priority, content_id, payload, max_send);
        }

        let mut msg = self.pool.get();
        msg.id = id;
        msg.reliable = reliable;
        msg.in_order = in_order;
        msg.priority = priority;
        msg.content_id = content_id;
        msg.message_number = self.next_message_number();
        msg.reliable_message_number = if reliable { self.next_reliable_number() } else { 0 };
        msg.payload.extend_from_slice(payload);

        match self.accept_queue.try_push(msg) {
            Result::Ok(()) => {
                self.wake_worker();
                Ok(())
            }
            Err(msg) => {
                let was_reliable = msg.reliable;
                self.pool.ret(msg);
                if was_reliable {
                    bail!("outbound accept queue is full");
                }
                debug!("accept queue full - dropping unreliable message {}", id);
                Ok(())
            }
        }
    }

    /// Splits an oversized message into reliable fragments sharing one transfer.
    fn split_and_queue(
        &self,
        id: u32,
        reliable: bool,
        in_order: bool,
        priority: u32,
        content_id: u32,
        payload: &[u8],
        max_send: usize,
    ) -> anyhow::Result<()> {
        let fragment_size = self.config.fragment_size(max_send);
        if fragment_size == 0 {
            bail!("socket datagram budget of {} is too small for fragmenting", max_send);
        }

        let total_fragments = payload.len().div_ceil(fragment_size) as u32;
        debug_assert!(total_fragments >= 2);

        if !reliable {
            debug!(
                "upgrading message {} of {} bytes to reliable: a lost fragment would waste the whole transfer",
                id,
                payload.len()
            );
        }

        let transfer = self.fragmented_sends.lock().unwrap().new_transfer(total_fragments);
        debug!(
            "splitting message {} of {} bytes into {} fragments of at most {} bytes",
            id,
            payload.len(),
            total_fragments,
            fragment_size
        );

        for (index, chunk) in payload.chunks(fragment_size).enumerate() {
            let mut msg = self.pool.get();
            msg.id = id;
            msg.reliable = true;
            msg.in_order = in_order;
            msg.priority = priority;
            msg.content_id = content_id;
            msg.message_number = self.next_message_number();
            msg.reliable_message_number = self.next_reliable_number();
            msg.fragment = Some(FragmentInfo {
                transfer,
                index: index as u32,
                total_fragments,
            });
            msg.payload.extend_from_slice(chunk);

            if let Err(msg) = self.accept_queue.try_push(msg) {
                self.pool.ret(msg);

                // shrink the transfer to the fragments that did get queued so it can still
                //  complete (or disappear entirely if nothing was queued)
                let mut sends = self.fragmented_sends.lock().unwrap();
                for _ in index as u32..total_fragments {
                    if sends.on_fragment_acked(transfer) {
                        break;
                    }
                }

                self.wake_worker();
                bail!("outbound accept queue filled up while splitting a fragmented message");
            }
        }

        self.wake_worker();
        Ok(())
    }

    /// next delivered message, or `None` if nothing arrives within `max_wait`
    pub async fn receive_message(&self, max_wait: Duration) -> Option<InboundMessage> {
        self.delivery_queue.pop_wait(max_wait).await
    }

    pub fn register_handler(&self, dispatcher: Arc<dyn MessageDispatcher>) {
        *self.dispatcher.lock().unwrap() = Some(dispatcher);
    }

    /// Drains up to `max_count` delivered messages into the registered handler; 0 means no
    ///  limit. Returns the number of messages dispatched.
    pub async fn process_messages(&self, max_count: usize) -> usize {
        let dispatcher = match self.dispatcher.lock().unwrap().clone() {
            Some(d) => d,
            None => {
                warn!("process_messages without a registered handler");
                return 0;
            }
        };

        let mut num_processed = 0;
        while max_count == 0 || num_processed < max_count {
            let msg = match self.delivery_queue.pop() {
                Some(msg) => msg,
                None => break,
            };
            dispatcher.on_message(msg.id, &msg.payload).await;
            num_processed += 1;
        }
        num_processed
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// waits for the connection to leave the pending state; true iff it became established
    pub async fn wait_for_established(&self, max_wait: Duration) -> bool {
        let mut state_rx = self.state_rx.clone();
        let result = tokio::time::timeout(max_wait, async move {
            loop {
                let state = *state_rx.borrow_and_update();
                if state != ConnectionState::Pending {
                    return state;
                }
                if state_rx.changed().await.is_err() {
                    return ConnectionState::Closed;
                }
            }
        })
        .await;

        matches!(result, Result::Ok(ConnectionState::Ok))
    }

    /// Cooperative teardown: queues a reliable Disconnect message and waits up to
    ///  `max_wait` for the handshake to complete.
    pub async fn disconnect(&self, max_wait: Duration) {
        {
            let inner = self.inner.lock().await;

            // fold the socket's actual status into the connection state first
            if !self.socket.is_read_open() && !self.socket.is_write_open() {
                inner.set_state(ConnectionState::Closed);
            }
            else if !self.socket.is_read_open() {
                inner.set_peer_closed();
            }
            else if !self.socket.is_write_open() && inner.state() == ConnectionState::Ok {
                inner.set_state(ConnectionState::Disconnecting);
            }

            match inner.state() {
                ConnectionState::Pending | ConnectionState::Ok => {
                    debug!("disconnecting: queueing disconnect message");
                    drop(inner);
                    self.queue_disconnect_message().await;
                    self.inner.lock().await.set_state(ConnectionState::Disconnecting);
                }
                ConnectionState::Disconnecting => {
                    trace!("disconnect called while already disconnecting");
                }
                ConnectionState::PeerClosed => {
                    drop(inner);
                    self.queue_disconnect_message().await;
                    self.inner.lock().await.set_state(ConnectionState::Closed);
                }
                ConnectionState::Closed => return,
            }
        }
        self.notify_worker();

        if !max_wait.is_zero() {
            let mut state_rx = self.state_rx.clone();
            let _ = tokio::time::timeout(max_wait, async move {
                while *state_rx.borrow_and_update() != ConnectionState::Closed {
                    if state_rx.changed().await.is_err() {
                        return;
                    }
                }
            })
            .await;
        }
    }

    /// Hard teardown: after an optional cooperative disconnect attempt, the connection is
    ///  closed immediately and all queued traffic is freed.
    pub async fn close(&self, max_wait: Duration) {
        if !max_wait.is_zero() {
            self.disconnect(max_wait).await;
        }

        let mut inner = self.inner.lock().await;
        inner.set_state(ConnectionState::Closed);
        self.free_all_pending(&mut inner);
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    pub fn rtt_millis(&self) -> f32 {
        self.stats.snapshot().rtt_millis
    }

    pub fn bytes_in_per_sec(&self) -> f32 {
        self.stats.snapshot().bytes_in_per_sec
    }

    pub fn bytes_out_per_sec(&self) -> f32 {
        self.stats.snapshot().bytes_out_per_sec
    }

    pub async fn retransmission_timeout(&self) -> Duration {
        self.inner.lock().await.rtt.rto()
    }

    pub async fn num_outbound_messages_pending(&self) -> usize {
        self.accept_queue.len() + self.inner.lock().await.outbound_queue.len()
    }

    pub fn pause_outbound_sends(&self) {
        self.outbound_sends_paused.store(true, Ordering::Relaxed);
    }

    pub fn resume_outbound_sends(&self) {
        self.outbound_sends_paused.store(false, Ordering::Relaxed);
        self.notify_worker();
    }

    // ---- worker-facing operations ------------------------------------------------------

    pub(crate) fn attach_worker(&self, wake: Arc<Notify>) {
        *self.worker_wake.lock().unwrap() = Some(wake);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.connection_state() == ConnectionState::Closed
    }

    /// Periodic bookkeeping: accept new outbound messages, keepalive, statistics, packet
    ///  timeouts, flow control and ack generation.
    pub(crate) async fn update_tick(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state() == ConnectionState::Closed {
            return;
        }
        let now = Instant::now();

        self.accept_outbound_messages(&mut inner);

        if inner.state() == ConnectionState::Ok && inner.ping_timer.triggered_or_not_running() {
            if !self.outbound_sends_paused.load(Ordering::Relaxed) {
                self.enqueue_ping_request(&mut inner, now);
            }
            inner.ping_timer.start(self.config.ping_interval);
        }

        if inner.stats_timer.triggered_or_not_running() {
            self.stats.refresh(now);
            self.detect_connection_timeout(&mut inner, now);
            if !self.socket.is_read_open() {
                inner.set_peer_closed();
            }
            inner.stats_timer.start(self.config.stats_refresh_interval);
        }

        if inner.update_timer.triggered_or_not_running() {
            self.process_packet_timeouts(&mut inner, now);
            inner.flow.handle_frame_tick(now);
            self.perform_packet_ack_sends(&mut inner, now);
            inner.update_timer.start(self.config.update_tick_interval);
        }
    }

    /// Reads and parses every datagram currently waiting in the socket, up to the read
    ///  throttle.
    pub(crate) async fn read_socket(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state() == ConnectionState::Closed {
            return;
        }
        if !self.socket.is_read_open() {
            inner.set_peer_closed();
            return;
        }

        let mut buf = self.buffer_pool.get();
        buf.resize(MAX_DATAGRAM_SIZE, 0);

        let mut total_bytes = 0u64;
        let mut reads_left = self.config.max_datagrams_per_read;
        while reads_left > 0 {
            reads_left -= 1;

            match self.socket.try_recv(&mut buf) {
                Result::Ok(Some(len)) if len > 0 => {
                    if inner.state() == ConnectionState::Pending {
                        debug!("first inbound bytes - connection established");
                        inner.set_state(ConnectionState::Ok);
                    }
                    total_bytes += len as u64;
                    self.extract_messages(&mut inner, &buf[..len]);
                }
                Result::Ok(_) => break,
                Err(e) => {
                    error!("socket error on receive: {}", e);
                    break;
                }
            }
        }

        if total_bytes > 0 {
            self.stats.add_inbound(Instant::now(), total_bytes, 0, 0);
        }
        if reads_left == 0 {
            warn!("too many inbound datagrams: read loop throttled");
        }

        self.buffer_pool.ret(buf);
    }

    /// Sends out packed datagrams while the pacing gate allows it, up to the burst limit.
    pub(crate) async fn send_out_packets(&self) {
        let mut inner = self.inner.lock().await;

        let mut sends_left = self.config.max_sends_per_burst;
        while sends_left > 0 {
            sends_left -= 1;
            if self.send_one_datagram(&mut inner) != PacketSendResult::Ok {
                break;
            }
        }
    }

    /// how long the pacing gate blocks the next send, `None` when there is nothing to send
    pub(crate) async fn time_until_next_send(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        if inner.outbound_queue.is_empty() {
            return None;
        }
        Some(inner.flow.time_until_can_send(Instant::now()))
    }

    // ---- internals ---------------------------------------------------------------------

    fn next_message_number(&self) -> u64 {
        self.message_number_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn next_reliable_number(&self) -> u32 {
        self.reliable_number_counter.fetch_add(1, Ordering::Relaxed) & RELIABLE_NUMBER_MASK
    }

    fn wake_worker(&self) {
        if self.outbound_sends_paused.load(Ordering::Relaxed) {
            return;
        }
        self.notify_worker();
    }

    fn notify_worker(&self) {
        if let Some(wake) = self.worker_wake.lock().unwrap().as_ref() {
            wake.notify_one();
        }
    }

    fn make_internal_message(&self, id: u32, payload: &[u8], priority: u32, reliable: bool) -> NetworkMessage {
        let mut msg = self.pool.get();
        msg.id = id;
        msg.reliable = reliable;
        msg.priority = priority;
        msg.message_number = self.next_message_number();
        msg.reliable_message_number = if reliable { self.next_reliable_number() } else { 0 };
        msg.payload.extend_from_slice(payload);
        msg
    }

    async fn queue_disconnect_message(&self) {
        let msg = self.make_internal_message(msg_id::DISCONNECT, &[], MAX_PRIORITY, true);
        if let Err(msg) = self.accept_queue.try_push(msg) {
            // push it past the full accept queue - teardown must not get stuck behind
            //  application traffic
            self.inner.lock().await.outbound_queue.push(msg);
        }
    }

    /// returns a message's resources to the pool, clearing its content-id slot if it was
    ///  the newest member
    fn free_message(&self, inner: &mut ConnectionInner, msg: NetworkMessage) {
        if msg.content_id != 0 {
            let key = (msg.id, msg.content_id);
            if inner.content_send_track.get(&key) == Some(&msg.message_number) {
                inner.content_send_track.remove(&key);
            }
        }
        self.pool.ret(msg);
    }

    fn free_all_pending(&self, inner: &mut ConnectionInner) {
        for msg in self.accept_queue.drain() {
            self.pool.ret(msg);
        }
        for msg in inner.outbound_queue.drain() {
            self.pool.ret(msg);
        }
        for track in inner.outbound_ack_tracks.drain() {
            for msg in track.messages {
                self.pool.ret(msg);
            }
        }
        inner.content_send_track.clear();
        inner.content_recv_stamps.clear();
        inner.pending_acks.clear();
        inner.fragmented_receives.clear();
        self.fragmented_sends.lock().unwrap().clear();
        self.delivery_queue.clear();
        self.stats.clear();
    }

    /// moves messages from the application hand-off queue into the priority queue,
    ///  maintaining the outbound content-id bookkeeping
    fn accept_outbound_messages(&self, inner: &mut ConnectionInner) {
        if !matches!(inner.state(), ConnectionState::Ok | ConnectionState::Disconnecting) {
            return;
        }

        for _ in 0..self.config.max_accepts_per_tick {
            let mut msg = match self.accept_queue.pop() {
                Some(msg) => msg,
                None => return,
            };

            if msg.content_id != 0 {
                let key = (msg.id, msg.content_id);
                match inner.content_send_track.get_mut(&key) {
                    Some(newest) => {
                        if msg.message_number > *newest {
                            // the message currently holding the slot becomes obsolete; the
                            //  packer will drop it when it reaches the queue head
                            *newest = msg.message_number;
                        }
                        else {
                            debug!(
                                "message {} in content slot {} is older than the pending one - marking obsolete",
                                msg.message_number, msg.content_id
                            );
                            msg.obsolete = true;
                        }
                    }
                    None => {
                        inner.content_send_track.insert(key, msg.message_number);
                    }
                }
            }

            inner.outbound_queue.push(msg);
        }
    }

    fn enqueue_ping_request(&self, inner: &mut ConnectionInner, now: Instant) {
        let ping_id = self.stats.start_ping(now);
        let msg = self.make_internal_message(msg_id::PING_REQUEST, &[ping_id], MAX_PRIORITY - 2, false);
        inner.outbound_queue.push(msg);
        trace!("enqueued ping request {}", ping_id);
    }

    fn detect_connection_timeout(&self, inner: &mut ConnectionInner, now: Instant) {
        if inner.state() == ConnectionState::Closed {
            return;
        }

        let silence = now.saturating_duration_since(inner.last_heard);
        if silence > self.config.connection_lost_timeout {
            warn!(
                "nothing heard from the peer for {:?} (limit {:?}) - closing connection",
                silence, self.config.connection_lost_timeout
            );
            inner.set_state(ConnectionState::Closed);
            self.free_all_pending(inner);
        }
    }

    /// Scans the ack track queue head for timed-out reliable packets. Packets time out in
    ///  the order they were sent, so the scan stops at the first non-expired entry.
    fn process_packet_timeouts(&self, inner: &mut ConnectionInner, now: Instant) {
        loop {
            match inner.outbound_ack_tracks.front() {
                Some(track) if track.timeout_at <= now => {}
                _ => return,
            }
            let track = inner.outbound_ack_tracks.pop_front().unwrap();

            debug!(
                "packet {} timed out after {:?} with {} reliable messages - requeueing",
                track.packet_id,
                now.saturating_duration_since(track.sent_at),
                track.messages.len()
            );

            inner.flow.on_loss(track.datagram_send_rate);
            inner.rtt.on_loss();

            // the messages go out again in a fresh datagram with a new packet id; their
            //  reliable message numbers stay put
            for msg in track.messages {
                inner.outbound_queue.push(msg);
            }
        }
    }

    /// Emits ack messages once the oldest pending ack is older than the ack delay or enough
    ///  acks have piled up for a full window. One trigger flushes all pending acks.
    fn perform_packet_ack_sends(&self, inner: &mut ConnectionInner, now: Instant) {
        let due = match inner.pending_acks.oldest_received_at() {
            None => false,
            Some(oldest) => {
                now.saturating_duration_since(oldest) >= self.config.max_ack_delay
                    || inner.pending_acks.len() >= self.config.max_pending_acks
            }
        };
        if !due {
            return;
        }

        while let Some((base, mask)) = inner.pending_acks.take_window() {
            let mut payload = [0u8; 7];
            payload[0] = (base.to_raw() & 0xff) as u8;
            payload[1..3].copy_from_slice(&((base.to_raw() >> 8) as u16).to_le_bytes());
            payload[3..7].copy_from_slice(&mask.to_le_bytes());

            trace!("acking base packet {} with mask {:08x}", base, mask);
            let msg = self.make_internal_message(msg_id::PACKET_ACK, &payload, MAX_PRIORITY - 1, false);
            inner.outbound_queue.push(msg);
        }
    }

    /// true iff a newer message occupies this message's content-id slot
    fn is_superseded(&self, inner: &ConnectionInner, msg: &NetworkMessage) -> bool {
        if msg.content_id == 0 {
            return false;
        }
        match inner.content_send_track.get(&(msg.id, msg.content_id)) {
            Some(&newest) => newest != msg.message_number,
            None => false,
        }
    }

    /// Packs messages from the priority queue into one datagram and hands it to the socket.
    fn send_one_datagram(&self, inner: &mut ConnectionInner) -> PacketSendResult {
        if !self.socket.is_write_open() {
            if inner.state() == ConnectionState::Ok {
                inner.set_state(ConnectionState::Disconnecting);
            }
            return PacketSendResult::SocketClosed;
        }
        if self.outbound_sends_paused.load(Ordering::Relaxed) {
            return PacketSendResult::NoMessages;
        }
        if inner.outbound_queue.is_empty() {
            return PacketSendResult::NoMessages;
        }

        let now = Instant::now();
        if !inner.flow.can_send(now) {
            return PacketSendResult::Throttled;
        }

        let max_send = self.socket.max_send_size();

        let mut selected: Vec<NetworkMessage> = Vec::new();
        let mut skipped: Vec<NetworkMessage> = Vec::new();
        let mut reliable = false;
        let mut in_order = false;
        let mut smallest_reliable = 0u32;
        // flag byte plus the 16-bit high part of the packet id
        let mut packet_size = PacketHeader::FIXED_LEN;

        while let Some(msg) = inner.outbound_queue.pop() {
            if msg.obsolete || self.is_superseded(inner, &msg) {
                trace!("dropping obsolete message {} from the outbound queue", msg.message_number);
                self.free_message(inner, msg);
                continue;
            }

            // a fragmented message needs a wire transfer id before it can go out
            if let Some(frag) = &msg.fragment {
                if self.fragmented_sends.lock().unwrap().wire_id_for_packing(frag.transfer).is_none() {
                    debug!("no free fragment transfer id - parking message until one frees up");
                    skipped.push(msg);
                    continue;
                }
            }

            let mut total_size = msg.packed_size();
            if msg.in_order && !in_order {
                // room for the order delta field in the packet header
                total_size += 2;
            }
            if msg.reliable && !reliable {
                // room for the base reliable message number in the packet header
                total_size += 4;
            }

            if !selected.is_empty() && packet_size + total_size >= max_send {
                inner.outbound_queue.push(msg);
                break;
            }

            packet_size += total_size;
            if msg.reliable {
                smallest_reliable = if reliable {
                    modular_older_number(smallest_reliable, msg.reliable_message_number)
                }
                else {
                    msg.reliable_message_number
                };
                reliable = true;
            }
            if msg.in_order {
                in_order = true;
            }
            selected.push(msg);
        }

        for msg in skipped {
            inner.outbound_queue.push(msg);
        }

        if selected.is_empty() {
            return PacketSendResult::NoMessages;
        }

        // craft the datagram
        let packet_id = inner.packet_id_counter;
        let order_delta = if in_order {
            let delta = inner
                .last_in_order_sent
                .map(|prev| packet_id.minus(prev).min(Vle8_16::MAX_VALUE))
                .unwrap_or(0);
            Some(delta as u16)
        }
        else {
            None
        };

        let mut buf = self.buffer_pool.get();
        PacketHeader {
            packet_id,
            base_reliable_number: reliable.then_some(smallest_reliable),
            order_delta,
        }
        .ser(&mut buf);

        let mut sent_disconnect_ack = false;
        for msg in &selected {
            if msg.id == msg_id::DISCONNECT_ACK {
                sent_disconnect_ack = true;
            }

            let id_len = if msg.carries_message_id() {
                Vle8_16_32::encoded_len(msg.id)
            }
            else {
                0
            };
            let content_len = (msg.payload.len() + id_len) as u16;
            MessageHeader::for_message(msg, content_len).ser(&mut buf);

            if msg.reliable {
                let delta = msg.reliable_message_number.wrapping_sub(smallest_reliable) & RELIABLE_NUMBER_MASK;
                debug_assert!(delta <= Vle8_16::MAX_VALUE);
                Vle8_16::encode(delta, &mut buf);
            }

            if let Some(frag) = &msg.fragment {
                let wire_id = self
                    .fragmented_sends
                    .lock()
                    .unwrap()
                    .wire_id_for_packing(frag.transfer)
                    .expect("wire id was allocated during message selection");
                if frag.index == 0 {
                    Vle8_16_32::encode(frag.total_fragments, &mut buf);
                }
                buf.put_u8(wire_id);
                if frag.index != 0 {
                    Vle8_16_32::encode(frag.index, &mut buf);
                }
            }

            if msg.carries_message_id() {
                Vle8_16_32::encode(msg.id, &mut buf);
            }
            buf.put_slice(&msg.payload);
        }
        debug_assert!(buf.len() <= max_send);

        trace!(
            "sending packet {} with {} messages, {} bytes",
            packet_id,
            selected.len(),
            buf.len()
        );

        let send_result = self.socket.try_send(&buf);
        let bytes_sent = buf.len() as u64;
        self.buffer_pool.ret(buf);

        match send_result {
            Result::Ok(true) => {}
            Result::Ok(false) => {
                debug!("socket cannot take data - returning {} messages to the queue", selected.len());
                for msg in selected {
                    inner.outbound_queue.push(msg);
                }
                return PacketSendResult::SocketFull;
            }
            Err(e) => {
                error!("socket error on send: {} - returning messages to the queue", e);
                for msg in selected {
                    inner.outbound_queue.push(msg);
                }
                return PacketSendResult::SocketFull;
            }
        }

        for msg in &mut selected {
            msg.send_count += 1;
        }

        inner.flow.on_datagram_sent(now);
        if in_order {
            inner.last_in_order_sent = Some(packet_id);
        }
        inner.packet_id_counter = packet_id.next();
        self.stats.add_outbound(now, bytes_sent, 1, selected.len() as u64);

        if reliable {
            let mut track = OutboundAckTrack {
                packet_id,
                sent_at: now,
                timeout_at: now + inner.rtt.rto(),
                send_count: 1,
                datagram_send_rate: inner.flow.rate(),
                messages: Vec::new(),
            };
            for msg in selected {
                if msg.reliable {
                    // ownership moves into the track until the packet is acked or times out
                    track.messages.push(msg);
                }
                else {
                    self.free_message(inner, msg);
                }
            }
            inner.outbound_ack_tracks.push(track);
        }
        else {
            for msg in selected {
                self.free_message(inner, msg);
            }
        }

        if sent_disconnect_ack {
            debug!("disconnect ack delivered to the socket - closing connection");
            inner.set_state(ConnectionState::Closed);
            self.free_all_pending(inner);
        }

        PacketSendResult::Ok
    }

    /// Parses one inbound datagram into messages. A parse error drops the remainder of the
    ///  datagram but leaves the connection open.
    fn extract_messages(&self, inner: &mut ConnectionInner, data: &[u8]) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id);
        let _entered = span.enter();

        // a datagram is applied all-or-nothing: if the delivery queue might not take all of
        //  its messages, drop it before acking anything
        if self.delivery_queue.capacity_left() < 64 {
            debug!("delivery queue nearly full - dropping datagram before acking");
            return;
        }

        let now = Instant::now();
        inner.last_heard = now;

        let mut read: &[u8] = data;
        let header = match PacketHeader::deser(&mut read) {
            Result::Ok(header) => header,
            Err(e) => {
                warn!("datagram with malformed packet header: {} - dropping", e);
                return;
            }
        };

        // A reliable packet is recorded for acking before the duplicate check: a duplicate
        //  usually means the original ack was lost, so it must be generated again.
        if header.base_reliable_number.is_some() {
            inner.pending_acks.record(header.packet_id, now);
        }

        if inner.received_packet_ids.contains(header.packet_id) {
            trace!("duplicate datagram {} - discarding", header.packet_id);
            return;
        }

        let base_reliable_number = header.base_reliable_number.unwrap_or(0);
        let mut num_messages = 0u64;

        while !read.is_empty() {
            let msg_header = match MessageHeader::deser(&mut read) {
                Result::Ok(h) => h,
                Err(e) => {
                    warn!("malformed message header in datagram {}: {} - dropping rest", header.packet_id, e);
                    return;
                }
            };

            // Duplicates still get parsed fully to keep the stream aligned, but are
            //  discarded before dispatch.
            let mut duplicate = false;
            if msg_header.reliable {
                let delta = match Vle8_16::decode(&mut read) {
                    Result::Ok(delta) => delta,
                    Err(_) => {
                        warn!("truncated reliable number delta in datagram {} - dropping rest", header.packet_id);
                        return;
                    }
                };
                let number = base_reliable_number.wrapping_add(delta) & RELIABLE_NUMBER_MASK;
                duplicate = inner.reliable_duplicates.check_and_record(number);
            }

            let mut total_fragments = 0u32;
            if msg_header.first_fragment {
                total_fragments = match Vle8_16_32::decode(&mut read) {
                    Result::Ok(t) if t >= 2 => t,
                    Result::Ok(t) => {
                        warn!("first fragment declares {} total fragments - dropping rest", t);
                        return;
                    }
                    Err(_) => {
                        warn!("truncated fragment count in datagram {} - dropping rest", header.packet_id);
                        return;
                    }
                };
            }

            let mut wire_transfer_id = 0u8;
            let mut fragment_index = 0u32;
            if msg_header.fragmented {
                if read.is_empty() {
                    warn!("truncated fragment transfer id in datagram {} - dropping rest", header.packet_id);
                    return;
                }
                wire_transfer_id = read[0];
                read = &read[1..];

                if !msg_header.first_fragment {
                    fragment_index = match Vle8_16_32::decode(&mut read) {
                        Result::Ok(idx) => idx,
                        Err(_) => {
                            warn!("truncated fragment index in datagram {} - dropping rest", header.packet_id);
                            return;
                        }
                    };
                }
            }

            let content_len = msg_header.content_len as usize;
            if read.len() < content_len {
                warn!(
                    "datagram {} declares {} content bytes but only {} are left - dropping rest",
                    header.packet_id,
                    content_len,
                    read.len()
                );
                return;
            }
            let content = &read[..content_len];
            read = &read[content_len..];

            if msg_header.first_fragment {
                if !duplicate {
                    inner.fragmented_receives.start_transfer(wire_transfer_id, total_fragments, content);
                }
            }
            else if msg_header.fragmented {
                if !duplicate && inner.fragmented_receives.add_fragment(wire_transfer_id, fragment_index, content) {
                    if let Some(assembled) = inner.fragmented_receives.assemble(wire_transfer_id) {
                        self.handle_inbound_message(inner, header.packet_id, &assembled, now);
                        num_messages += 1;
                    }
                }
            }
            else if !duplicate {
                self.handle_inbound_message(inner, header.packet_id, content, now);
                num_messages += 1;
            }
        }

        inner.received_packet_ids.add(header.packet_id);
        self.stats.record_received_packet_id(now, header.packet_id);
        self.stats.add_inbound(now, 0, 1, num_messages);
    }

    /// Dispatches one parsed message: transport-internal ids are handled here, everything
    ///  else goes to the delivery queue after the content-id obsolescence check.
    fn handle_inbound_message(&self, inner: &mut ConnectionInner, packet_id: PacketId, content: &[u8], now: Instant) {
        let mut read = content;
        let message_id = match Vle8_16_32::decode(&mut read) {
            Result::Ok(id) => id,
            Err(_) => {
                warn!("message without a parsable message id - dropping");
                return;
            }
        };
        let payload = read;

        match message_id {
            msg_id::PACKET_ACK => self.handle_packet_ack(inner, payload, now),
            msg_id::DISCONNECT => self.handle_disconnect(inner),
            msg_id::DISCONNECT_ACK => self.handle_disconnect_ack(inner),
            msg_id::PING_REQUEST => {
                if payload.len() != 1 {
                    warn!("malformed ping request of {} bytes - expected 1", payload.len());
                    return;
                }
                let reply = self.make_internal_message(msg_id::PING_REPLY, &[payload[0]], MAX_PRIORITY - 1, false);
                inner.outbound_queue.push(reply);
            }
            msg_id::PING_REPLY => {
                if payload.len() != 1 {
                    warn!("malformed ping reply of {} bytes - expected 1", payload.len());
                    return;
                }
                self.stats.on_ping_reply(now, payload[0]);
            }
            msg_id::FLOW_CONTROL_REQUEST => {
                // reserved; consumed so it never reaches the application
                trace!("ignoring flow control request message");
            }
            _ => {
                let content_id = self
                    .dispatcher
                    .lock()
                    .unwrap()
                    .as_ref()
                    .map(|d| d.compute_content_id(message_id, payload))
                    .unwrap_or(0);
                if content_id != 0 && !self.check_and_save_content_stamp(inner, message_id, content_id, packet_id, now) {
                    debug!(
                        "message {} in packet {} with content id {} is obsolete - skipping",
                        message_id, packet_id, content_id
                    );
                    return;
                }

                let delivered = self.delivery_queue.try_push(InboundMessage {
                    id: message_id,
                    payload: payload.to_vec(),
                });
                if !delivered {
                    error!("delivery queue full - dropping message {}", message_id);
                }
            }
        }
    }

    /// true iff the message is fresh enough for its content-id slot and the stamp was
    ///  updated
    fn check_and_save_content_stamp(
        &self,
        inner: &mut ConnectionInner,
        message_id: u32,
        content_id: u32,
        packet_id: PacketId,
        now: Instant,
    ) -> bool {
        let key = (message_id, content_id);
        match inner.content_recv_stamps.get_mut(&key) {
            None => {
                inner.content_recv_stamps.insert(key, (packet_id, now));
                true
            }
            Some(stamp) => {
                let expired = now.saturating_duration_since(stamp.1) > self.config.content_stamp_expiry;
                if packet_id.is_newer_than(stamp.0) || expired {
                    *stamp = (packet_id, now);
                    true
                }
                else {
                    false
                }
            }
        }
    }

    fn handle_packet_ack(&self, inner: &mut ConnectionInner, payload: &[u8], now: Instant) {
        if payload.len() != 7 {
            warn!("malformed packet ack of {} bytes - expected 7", payload.len());
            return;
        }

        let low = payload[0] as u32;
        let high = u16::from_le_bytes([payload[1], payload[2]]) as u32;
        let base = PacketId::from_raw(low | (high << 8));
        let mask = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]);

        trace!("received ack for base packet {} with mask {:08x}", base, mask);

        self.free_outbound_ack_track(inner, base, now);
        for k in 0..ACK_WINDOW_WIDTH {
            if mask & (1 << k) != 0 {
                self.free_outbound_ack_track(inner, base.plus(k + 1), now);
            }
        }
    }

    /// The peer acknowledged this packet: its reliable messages are done for good. A
    ///  first-attempt ack doubles as an RTT sample.
    fn free_outbound_ack_track(&self, inner: &mut ConnectionInner, packet_id: PacketId, now: Instant) {
        let track = match inner.outbound_ack_tracks.remove(packet_id) {
            Some(track) => track,
            None => return,
        };

        for msg in track.messages {
            if let Some(frag) = &msg.fragment {
                self.fragmented_sends.lock().unwrap().on_fragment_acked(frag.transfer);
            }
            self.free_message(inner, msg);
        }

        if track.send_count <= 1 {
            inner
                .rtt
                .on_ack_sample(now.saturating_duration_since(track.sent_at).as_secs_f32());
            inner.flow.on_ack();
        }
    }

    fn handle_disconnect(&self, inner: &mut ConnectionInner) {
        if inner.state() == ConnectionState::Closed {
            return;
        }
        debug!("peer requested disconnect - acknowledging");
        inner.set_state(ConnectionState::Disconnecting);
        let ack = self.make_internal_message(msg_id::DISCONNECT_ACK, &[], MAX_PRIORITY - 1, false);
        inner.outbound_queue.push(ack);
    }

    fn handle_disconnect_ack(&self, inner: &mut ConnectionInner) {
        if inner.state() != ConnectionState::Disconnecting {
            warn!("received disconnect ack in state {:?}", inner.state());
        }
        inner.set_state(ConnectionState::Closed);
        self.free_all_pending(inner);
    }
}

/// modular 'older of the two' in the wrapping 31-bit reliable number space
fn modular_older_number(a: u32, b: u32) -> u32 {
    if b.wrapping_sub(a) & RELIABLE_NUMBER_MASK < (1 << 30) {
        a
    }
    else {
        b
    }
}
