//! Per-peer connection: reliability, ordering, lifecycle and the tick loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time;

use crate::acknowledge::Acknowledgement;
use crate::binary::{load_uint24, write_uint24, Uint24};
use crate::dispatch::{self, Disposition};
use crate::error::{Error, Result};
use crate::event::{DisconnectReason, Event};
use crate::handler::ConnectionHandler;
use crate::message::{InternalPing, ReceivedStaticData, RequestStaticData, TimestampSync};
use crate::packet::{
    datagram_checksum, split, Packet, Reliability, BIT_FLAG_ACK, BIT_FLAG_DATAGRAM, BIT_FLAG_NACK,
};
use crate::order_queue::OrderQueue;
use crate::recv_window::ReceiveWindow;
use crate::resend_map::ResendMap;
use crate::state::ConnectionState;
use crate::tags::{MessageKind, TagTable};
use crate::{timestamp, MAX_MTU_SIZE, MAX_ORDER_CHANNELS, MAX_WINDOW_SIZE, MIN_MTU_SIZE};

/// Maximum number of split fragments.
const MAX_SPLIT_COUNT: u32 = 512;

/// Maximum number of concurrent split packets.
const MAX_CONCURRENT_SPLITS: usize = 16;

/// Tunables for one connection.
#[derive(Debug, Clone)]
pub struct ConnSettings {
    /// The active tag table, shared by both endpoints.
    pub table: Arc<TagTable>,

    /// MTU for this connection, clamped to the supported range.
    pub mtu: u16,

    /// Silence window after which the connection is considered lost.
    pub timeout: Duration,

    /// Base retransmission timeout; doubled per retry of a message.
    pub base_rto: Duration,

    /// Retransmissions allowed per reliable message before the connection is
    /// declared lost.
    pub max_retries: u32,

    /// Our static data blob, pushed to the peer after connecting.
    pub static_data: Vec<u8>,
}

impl ConnSettings {
    /// Default settings for the given tag table.
    pub fn new(table: Arc<TagTable>) -> Self {
        Self {
            table,
            mtu: MAX_MTU_SIZE,
            timeout: Duration::from_secs(10),
            base_rto: Duration::from_millis(100),
            max_retries: 8,
            static_data: Vec::new(),
        }
    }
}

/// Represents one remote peer.
pub struct Conn {
    /// The underlying UDP socket.
    socket: Arc<UdpSocket>,

    /// Remote address of the peer.
    remote_addr: SocketAddr,

    /// Role-specific handshake handler.
    handler: Arc<dyn ConnectionHandler>,

    /// Connection tunables and the active tag table.
    settings: ConnSettings,

    /// Lifecycle state.
    lifecycle: RwLock<ConnectionState>,

    /// Round-trip time in nanoseconds.
    rtt: AtomicI64,

    /// Estimated offset between the remote clock and ours, in milliseconds.
    clock_offset: AtomicI64,

    /// Unix timestamp when graceful closing started, 0 if not closing.
    closing: AtomicI64,

    /// Notifier for when the handshake completes.
    connected_notify: Notify,

    /// Whether the connection has fully stopped.
    closed: AtomicBool,

    /// Cancellation notifier for the tick, sender and receive tasks.
    cancel_notify: Arc<Notify>,

    /// Mutex-protected reliability state (async-safe).
    state: Arc<Mutex<ConnState>>,

    /// Channel for user payloads released in order.
    packet_tx: mpsc::Sender<Bytes>,
    packet_rx: Mutex<mpsc::Receiver<Bytes>>,

    /// Channel for lifecycle events.
    event_tx: mpsc::Sender<Event>,
    event_rx: Mutex<mpsc::Receiver<Event>>,

    /// Channel for outgoing datagrams (avoids spawning tasks per send).
    send_tx: mpsc::Sender<Bytes>,

    /// Last inbound activity timestamp.
    last_activity: RwLock<Instant>,

    /// The peer's static data, if received.
    remote_static_data: RwLock<Vec<u8>>,

    /// Why the handshake was rejected, surfaced through the dialer.
    reject_reason: SyncMutex<Option<Error>>,

    /// Buffer for ACK packets.
    ack_buf: Mutex<Vec<u8>>,

    /// Buffer for NACK packets.
    nack_buf: Mutex<Vec<u8>>,
}

/// Mutable reliability state protected by a mutex.
struct ConnState {
    /// Buffer for building datagrams.
    buf: Vec<u8>,

    /// Reusable packet for reading.
    pk: Packet,

    /// Datagram sequence number counter.
    seq: Uint24,

    /// Message index counter for reliable messages.
    message_index: Uint24,

    /// Order index counter per ordering channel.
    order_index: [Uint24; MAX_ORDER_CHANNELS],

    /// Split ID counter.
    split_id: u32,

    /// Map of split packets being reassembled.
    splits: HashMap<u16, Vec<Vec<u8>>>,

    /// Window of received datagram sequence numbers.
    win: ReceiveWindow,

    /// Pending ACK sequence numbers.
    ack_slice: Vec<Uint24>,

    /// In-order release queue per ordering channel.
    order_queues: Vec<OrderQueue>,

    /// Reliable messages pending acknowledgement.
    retransmission: ResendMap,
}

impl Conn {
    /// Creates a new connection in the `Unconnected` state.
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        handler: Arc<dyn ConnectionHandler>,
        mut settings: ConnSettings,
    ) -> Arc<Self> {
        settings.mtu = settings.mtu.clamp(MIN_MTU_SIZE, MAX_MTU_SIZE);
        let (packet_tx, packet_rx) = mpsc::channel(4096);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (send_tx, send_rx) = mpsc::channel::<Bytes>(256);

        let conn = Arc::new(Self {
            socket,
            remote_addr,
            handler,
            lifecycle: RwLock::new(ConnectionState::Unconnected),
            rtt: AtomicI64::new(0),
            clock_offset: AtomicI64::new(0),
            closing: AtomicI64::new(0),
            connected_notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancel_notify: Arc::new(Notify::new()),
            state: Arc::new(Mutex::new(ConnState {
                buf: Vec::with_capacity((settings.mtu - 28) as usize),
                pk: Packet::new(),
                seq: Uint24::new(0),
                message_index: Uint24::new(0),
                order_index: [Uint24::new(0); MAX_ORDER_CHANNELS],
                split_id: 0,
                splits: HashMap::new(),
                win: ReceiveWindow::new(),
                ack_slice: Vec::new(),
                order_queues: (0..MAX_ORDER_CHANNELS).map(|_| OrderQueue::new()).collect(),
                retransmission: ResendMap::new(),
            })),
            packet_tx,
            packet_rx: Mutex::new(packet_rx),
            event_tx,
            event_rx: Mutex::new(event_rx),
            last_activity: RwLock::new(Instant::now()),
            remote_static_data: RwLock::new(Vec::new()),
            reject_reason: SyncMutex::new(None),
            ack_buf: Mutex::new(Vec::with_capacity(128)),
            nack_buf: Mutex::new(Vec::with_capacity(64)),
            send_tx,
            settings,
        });

        // Start the ticker task
        let conn_clone = Arc::clone(&conn);
        tokio::spawn(async move {
            conn_clone.start_ticking().await;
        });

        // Start the sender task
        let socket = Arc::clone(&conn.socket);
        let remote_addr = conn.remote_addr;
        let cancel = Arc::clone(&conn.cancel_notify);
        tokio::spawn(async move {
            Self::sender_task(socket, remote_addr, send_rx, cancel).await;
        });

        conn
    }

    /// Returns the effective MTU (minus IP/UDP headers).
    pub fn effective_mtu(&self) -> u16 {
        self.settings.mtu - 28
    }

    /// Returns the remote address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Returns the local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.lifecycle.read()
    }

    /// Returns the active tag table.
    pub fn table(&self) -> &TagTable {
        &self.settings.table
    }

    /// Returns the current latency (half of RTT).
    pub fn latency(&self) -> Duration {
        Duration::from_nanos((self.rtt.load(Ordering::Relaxed) / 2) as u64)
    }

    /// Estimated offset of the peer's clock relative to ours, in
    /// milliseconds. Zero until a timestamp from the peer was observed.
    pub fn clock_offset(&self) -> i64 {
        self.clock_offset.load(Ordering::Relaxed)
    }

    /// Returns the peer's static data, empty if none was received.
    pub fn remote_static_data(&self) -> Vec<u8> {
        self.remote_static_data.read().clone()
    }

    /// Asks the peer to send its static data again. The answer surfaces as
    /// [`Event::StaticDataReceived`].
    pub fn request_remote_static_data(&self) -> Result<()> {
        self.send_message(&RequestStaticData.write(self.table()))
    }

    /// Pushes our current clock to the peer so it can maintain an offset.
    pub fn sync_clock(&self) -> Result<()> {
        let sync = TimestampSync::new(timestamp());
        self.send_message(&sync.write(self.table()))
    }

    /// Probes whether the peer is still alive. The peer answers with a ping,
    /// which refreshes the activity window on both ends.
    pub fn detect_lost_connection(&self) -> Result<()> {
        let tag = self.table().tag(MessageKind::DetectLostConnections);
        self.send_message(&[tag])
    }

    /// Returns a clone of the cancel notify for use in receive loops.
    pub(crate) fn get_cancel_notify(&self) -> Arc<Notify> {
        Arc::clone(&self.cancel_notify)
    }

    /// Our own static data blob.
    pub(crate) fn static_data(&self) -> Vec<u8> {
        self.settings.static_data.clone()
    }

    /// The role-specific handler.
    pub(crate) fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    /// Moves the lifecycle forward, rejecting transitions the state machine
    /// forbids.
    pub(crate) fn transition(&self, next: ConnectionState) -> Result<()> {
        let mut cur = self.lifecycle.write();
        if !cur.can_transition_to(next) {
            return Err(Error::IllegalTransition {
                from: cur.name(),
                to: next.name(),
            });
        }
        tracing::debug!(peer = %self.remote_addr, from = %*cur, to = %next, "connection state");
        *cur = next;
        Ok(())
    }

    /// Forces a terminal state, regardless of the current one.
    fn force_terminal(&self, terminal: ConnectionState) {
        let mut cur = self.lifecycle.write();
        if !cur.is_terminal() {
            *cur = terminal;
        }
    }

    /// Emits a lifecycle event. Best effort: a slow consumer drops events
    /// rather than stalling the transport.
    pub(crate) fn emit_event(&self, event: Event) {
        let _ = self.event_tx.try_send(event);
    }

    /// Records why the handshake was rejected and closes gracefully, so a
    /// rejection message still pending in the reliability layer drains first.
    pub(crate) fn reject(&self, reason: Error) {
        *self.reject_reason.lock() = Some(reason);
        self.close_later();
        self.connected_notify.notify_waiters();
    }

    /// Takes the recorded rejection reason, if any.
    pub(crate) fn take_reject_reason(&self) -> Option<Error> {
        self.reject_reason.lock().take()
    }

    /// Marks the connection as established and pushes our static data.
    pub(crate) fn mark_connected(&self) -> Result<()> {
        self.transition(ConnectionState::Connected)?;
        self.connected_notify.notify_waiters();
        self.emit_event(Event::Connected {
            peer: self.remote_addr,
        });

        if !self.settings.static_data.is_empty() {
            let msg = ReceivedStaticData::new(self.settings.static_data.clone());
            self.send_message(&msg.write(self.table()))?;
        }
        Ok(())
    }

    /// Waits for the handshake to complete. Also returns once the connection
    /// is rejected or closed; callers check [`Conn::is_connected`].
    pub async fn wait_connected(&self) {
        loop {
            let notified = self.connected_notify.notified();
            if self.state() == ConnectionState::Connected
                || self.closed.load(Ordering::Relaxed)
                || self.closing.load(Ordering::Relaxed) != 0
            {
                return;
            }
            notified.await;
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Updates the RTT estimate from a pong echoing our ping timestamp.
    pub(crate) fn observe_pong(&self, ping_time: i64) -> Result<()> {
        let now = timestamp();
        if ping_time > now {
            return Err(Error::TimestampInFuture);
        }
        let rtt_ms = now - ping_time;
        self.rtt.store(rtt_ms * 1_000_000, Ordering::Relaxed);
        Ok(())
    }

    /// Updates the clock offset from an embedded remote timestamp.
    pub(crate) fn observe_remote_time(&self, remote_time: i64) {
        self.clock_offset
            .store(remote_time - timestamp(), Ordering::Relaxed);
    }

    /// Stores the peer's static data and surfaces the change.
    pub(crate) fn store_remote_static_data(&self, data: &[u8]) {
        *self.remote_static_data.write() = data.to_vec();
        self.emit_event(Event::StaticDataReceived {
            peer: self.remote_addr,
            data: data.to_vec(),
        });
    }

    /// Sends a user payload with the given reliability on the given ordering
    /// channel. Returns immediately; transmission and retransmission are
    /// driven by the tick.
    ///
    /// The first byte of `data` is the message tag and must be at or above
    /// the tag table's user boundary, otherwise the receiving dispatcher
    /// treats the payload as a transport message.
    pub async fn write_with(
        &self,
        data: &[u8],
        reliability: Reliability,
        channel: u8,
    ) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::ZeroPacket);
        }
        if !self.state().allows_user_data() {
            return Err(Error::ConnectionClosed);
        }
        if (channel as usize) >= MAX_ORDER_CHANNELS {
            return Err(Error::Other(format!(
                "ordering channel {channel} out of range"
            )));
        }

        let mut state = self.state.lock().await;
        self.write_locked(&mut state, data, reliability, channel).await
    }

    /// Sends a user payload reliable-ordered on channel 0.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_with(data, Reliability::ReliableOrdered, 0).await
    }

    /// Internal write with lock already held.
    async fn write_locked(
        &self,
        state: &mut ConnState,
        data: &[u8],
        reliability: Reliability,
        channel: u8,
    ) -> Result<usize> {
        let fragments = split(data, self.effective_mtu());
        let order_index = state.order_index[channel as usize].inc();

        let split_id = state.split_id as u16;
        if fragments.len() > 1 {
            state.split_id = state.split_id.wrapping_add(1);
        }

        let mut n = 0;
        for (split_index, content) in fragments.iter().enumerate() {
            let mut pk = Packet::new();
            pk.reliability = reliability;
            pk.content = content.to_vec();
            pk.order_index = order_index;
            pk.order_channel = channel;
            if reliability.is_reliable() {
                pk.message_index = state.message_index.inc();
            }

            if fragments.len() > 1 {
                pk.split = true;
                pk.split_count = fragments.len() as u32;
                pk.split_index = split_index as u32;
                pk.split_id = split_id;
            }

            self.send_datagram(state, pk).await?;
            n += content.len();
        }

        Ok(n)
    }

    /// Reads a user payload from the connection.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut rx = self.packet_rx.lock().await;

        if self.closed.load(Ordering::Relaxed) {
            // Drain payloads that arrived before the close.
            return match rx.try_recv() {
                Ok(data) => {
                    if buf.len() < data.len() {
                        return Err(Error::BufferTooSmall);
                    }
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Err(_) => Err(Error::ConnectionClosed),
            };
        }

        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(data) => {
                        let len = data.len();
                        if buf.len() < len {
                            return Err(Error::BufferTooSmall);
                        }
                        buf[..len].copy_from_slice(&data);
                        Ok(len)
                    }
                    None => Err(Error::ConnectionClosed),
                }
            }
            _ = self.cancel_notify.notified() => {
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Reads a user payload and returns it as owned bytes.
    pub async fn read_packet(&self) -> Result<Bytes> {
        let mut rx = self.packet_rx.lock().await;

        if self.closed.load(Ordering::Relaxed) {
            return rx.try_recv().map_err(|_| Error::ConnectionClosed);
        }

        tokio::select! {
            result = rx.recv() => {
                result.ok_or(Error::ConnectionClosed)
            }
            _ = self.cancel_notify.notified() => {
                Err(Error::ConnectionClosed)
            }
        }
    }

    /// Waits for the next lifecycle event.
    pub async fn next_event(&self) -> Option<Event> {
        let mut rx = self.event_rx.lock().await;
        rx.recv().await
    }

    /// Dedicated sender task that processes outgoing datagrams.
    async fn sender_task(
        socket: Arc<UdpSocket>,
        remote_addr: SocketAddr,
        mut rx: mpsc::Receiver<Bytes>,
        cancel: Arc<Notify>,
    ) {
        loop {
            tokio::select! {
                Some(data) = rx.recv() => {
                    if let Err(e) = socket.send_to(&data, remote_addr).await {
                        tracing::debug!("failed to send to {}: {}", remote_addr, e);
                    }
                }
                _ = cancel.notified() => {
                    // Drain remaining messages
                    while let Ok(data) = rx.try_recv() {
                        let _ = socket.send_to(&data, remote_addr).await;
                    }
                    return;
                }
            }
        }
    }

    /// Requests a graceful close: drains pending reliable messages, then
    /// notifies the peer and stops.
    pub async fn close(&self) -> Result<()> {
        self.close_later();
        Ok(())
    }

    /// Synchronous variant of [`Conn::close`], usable from handlers.
    pub(crate) fn close_later(&self) {
        let _ = self.transition(ConnectionState::Disconnecting);

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        self.closing
            .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst)
            .ok();
    }

    /// Drops the connection into the `Banned` terminal state and stops it.
    /// The ban notice, if any, was queued by the caller and drains through
    /// the sender task.
    pub(crate) fn ban(&self) {
        self.force_terminal(ConnectionState::Banned);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handler.close(self);
        self.cancel_notify.notify_waiters();
        self.connected_notify.notify_waiters();
    }

    /// Stops the connection immediately, emitting at most one terminal
    /// event chosen by `reason`.
    pub(crate) fn close_with(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.force_terminal(ConnectionState::Closed);

        match reason {
            DisconnectReason::Local => {
                // A graceful local close notified the peer already; no event
                // for ourselves.
            }
            DisconnectReason::Notified => {
                self.emit_event(Event::DisconnectionNotification {
                    peer: self.remote_addr,
                });
            }
            DisconnectReason::TimedOut
            | DisconnectReason::RetriesExhausted
            | DisconnectReason::ModifiedPacket => {
                self.emit_event(Event::ConnectionLost {
                    peer: self.remote_addr,
                    reason,
                });
            }
        }

        self.handler.close(self);
        self.cancel_notify.notify_waiters();
        self.connected_notify.notify_waiters();
    }

    /// Sends an internal protocol message, reliable-ordered on channel 0.
    /// Uses the dedicated send channel to avoid spawning tasks.
    pub(crate) fn send_message(&self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        let state = self.state.clone();
        let send_tx = self.send_tx.clone();

        tokio::spawn(async move {
            let mut state = state.lock().await;

            let mut pk = Packet::new();
            pk.content = data;
            pk.order_index = state.order_index[0].inc();
            pk.message_index = state.message_index.inc();

            let mut buf = Vec::with_capacity(128);
            buf.push(BIT_FLAG_DATAGRAM);
            let seq = state.seq.inc();
            write_uint24(&mut buf, seq);
            pk.write(&mut buf);
            Self::seal_frame(&mut buf);

            state.retransmission.add(seq, pk);
            drop(state);

            // Send via channel (non-blocking)
            let _ = send_tx.try_send(Bytes::from(buf));
        });

        Ok(())
    }

    /// Tells the peer we are going away. Sent once, unacknowledged, right
    /// before the connection stops.
    async fn send_disconnect_notification(&self) {
        let tag = self.table().tag(MessageKind::DisconnectionNotification);

        let mut state = self.state.lock().await;
        let mut pk = Packet::new();
        pk.content = vec![tag];
        pk.order_index = state.order_index[0].inc();
        pk.message_index = state.message_index.inc();

        let mut buf = Vec::with_capacity(32);
        buf.push(BIT_FLAG_DATAGRAM);
        write_uint24(&mut buf, state.seq.inc());
        pk.write(&mut buf);
        Self::seal_frame(&mut buf);
        drop(state);

        let _ = self.send_tx.send(Bytes::from(buf)).await;
    }

    /// Appends the integrity checksum to a finished frame.
    fn seal_frame(buf: &mut Vec<u8>) {
        let sum = datagram_checksum(buf);
        buf.extend_from_slice(&sum.to_be_bytes());
    }

    /// Verifies and strips the trailing checksum of a received frame.
    fn verify_frame<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        if data.len() < 5 {
            return Err(Error::ModifiedPacket);
        }
        let (payload, tail) = data.split_at(data.len() - 4);
        let got = u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if got != datagram_checksum(payload) {
            return Err(Error::ModifiedPacket);
        }
        Ok(payload)
    }

    /// Sends a datagram containing a packet.
    async fn send_datagram(&self, state: &mut ConnState, pk: Packet) -> Result<()> {
        state.buf.clear();
        state.buf.push(BIT_FLAG_DATAGRAM);
        let seq = state.seq.inc();
        write_uint24(&mut state.buf, seq);
        pk.write(&mut state.buf);
        Self::seal_frame(&mut state.buf);

        // Clone into Bytes for zero-copy sending
        let data = Bytes::copy_from_slice(&state.buf);
        if pk.reliability.is_reliable() {
            state.retransmission.add(seq, pk);
        }

        self.send_tx
            .send(data)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(())
    }

    /// Receives and processes a frame from the network.
    pub(crate) async fn receive(&self, data: &[u8]) -> Result<()> {
        *self.last_activity.write() = Instant::now();

        if data.is_empty() {
            return Ok(());
        }

        if data[0] & BIT_FLAG_DATAGRAM == 0 {
            // A stray offline message, e.g. a duplicated open-connection
            // reply. Not part of the session.
            return Ok(());
        }

        let payload = match self.verify_frame(data) {
            Ok(payload) => payload,
            Err(e) => {
                // Tampering is fatal and non-retryable.
                tracing::debug!(peer = %self.remote_addr, "datagram failed integrity check");
                self.emit_event(Event::ModifiedPacket {
                    peer: self.remote_addr,
                });
                self.close_with(DisconnectReason::ModifiedPacket);
                return Err(e);
            }
        };

        match payload[0] {
            b if b & BIT_FLAG_ACK != 0 => self.handle_ack(&payload[1..]).await,
            b if b & BIT_FLAG_NACK != 0 => self.handle_nack(&payload[1..]).await,
            b if b & BIT_FLAG_DATAGRAM != 0 => self.receive_datagram(&payload[1..]).await,
            _ => Ok(()),
        }
    }

    /// Handles a received datagram.
    async fn receive_datagram(&self, data: &[u8]) -> Result<()> {
        if data.len() < 3 {
            return Err(Error::UnexpectedEof);
        }

        let seq = load_uint24(data);

        let (missing, window_error) = {
            let mut state = self.state.lock().await;

            if !state.win.add(seq) {
                // Duplicate datagram, dropped silently.
                return Ok(());
            }

            state.ack_slice.push(seq);

            let missing = if state.win.shift() == 0 {
                // Window could not shift, something is missing.
                let rtt = Duration::from_nanos(self.rtt.load(Ordering::Relaxed) as u64);
                state.win.missing(rtt + rtt / 2)
            } else {
                Vec::new()
            };

            let window_error =
                if state.win.size() > MAX_WINDOW_SIZE && self.handler.limits_enabled() {
                    Some((state.win.lowest.value(), state.win.highest.value()))
                } else {
                    None
                };

            (missing, window_error)
        };

        // Send NACK outside of lock
        if !missing.is_empty() {
            self.send_nack(&missing).await?;
        }

        if let Some((lowest, highest)) = window_error {
            return Err(Error::WindowSizeTooBig { lowest, highest });
        }

        self.handle_datagram(&data[3..]).await
    }

    /// Handles datagram contents.
    async fn handle_datagram(&self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let (pk, n) = {
                let mut state = self.state.lock().await;
                let n = state.pk.read(data)?;
                (std::mem::take(&mut state.pk), n)
            };
            data = &data[n..];

            if pk.split {
                self.receive_split_packet(pk).await?;
            } else {
                self.receive_packet(pk).await?;
            }
        }
        Ok(())
    }

    /// Receives a non-split packet.
    async fn receive_packet(&self, pk: Packet) -> Result<()> {
        if !pk.reliability.is_ordered() {
            // Unordered payloads are handled immediately.
            return self.handle_packet(pk.content).await;
        }

        let channel = pk.order_channel as usize;
        if channel >= MAX_ORDER_CHANNELS {
            return Err(Error::Other(format!(
                "ordering channel {channel} out of range"
            )));
        }

        let packets_to_handle = {
            let mut state = self.state.lock().await;

            if !state.order_queues[channel].put(pk.order_index, pk.content) {
                // Duplicate order index, released at most once.
                return Ok(());
            }

            if state.order_queues[channel].window_size() > MAX_WINDOW_SIZE
                && self.handler.limits_enabled()
            {
                return Err(Error::WindowSizeTooBig {
                    lowest: state.order_queues[channel].lowest.value(),
                    highest: state.order_queues[channel].highest.value(),
                });
            }

            state.order_queues[channel].fetch()
        };

        for content in packets_to_handle {
            self.handle_packet(content).await?;
        }

        Ok(())
    }

    /// Receives a split packet fragment.
    async fn receive_split_packet(&self, pk: Packet) -> Result<()> {
        let combined_pk = {
            let mut state = self.state.lock().await;

            if pk.split_count > MAX_SPLIT_COUNT && self.handler.limits_enabled() {
                return Err(Error::SplitPacket(format!(
                    "split count {} exceeds maximum {}",
                    pk.split_count, MAX_SPLIT_COUNT
                )));
            }

            if state.splits.len() > MAX_CONCURRENT_SPLITS && self.handler.limits_enabled() {
                return Err(Error::SplitPacket(format!(
                    "maximum concurrent splits {MAX_CONCURRENT_SPLITS} reached"
                )));
            }

            let fragments = state
                .splits
                .entry(pk.split_id)
                .or_insert_with(|| vec![Vec::new(); pk.split_count as usize]);

            if pk.split_index >= fragments.len() as u32 {
                return Err(Error::SplitPacket(format!(
                    "split index {} is out of range (0 - {})",
                    pk.split_index,
                    fragments.len() - 1
                )));
            }

            fragments[pk.split_index as usize] = pk.content.clone();

            // Check if all fragments received
            if fragments.iter().any(|f| f.is_empty()) {
                return Ok(());
            }

            let combined: Vec<u8> = fragments.iter().flatten().copied().collect();
            state.splits.remove(&pk.split_id);

            let mut combined_pk = Packet::new();
            combined_pk.content = combined;
            combined_pk.order_index = pk.order_index;
            combined_pk.order_channel = pk.order_channel;
            combined_pk.reliability = pk.reliability;
            combined_pk
        };

        self.receive_packet(combined_pk).await
    }

    /// Routes a complete decoded message through the dispatcher.
    async fn handle_packet(&self, content: Vec<u8>) -> Result<()> {
        if content.is_empty() {
            return Err(Error::ZeroPacket);
        }

        if self.closing.load(Ordering::Relaxed) != 0 {
            return Ok(());
        }

        match dispatch::dispatch(self, &content) {
            Ok(Disposition::Consumed) => Ok(()),
            Ok(Disposition::User) => {
                // Surface to the application verbatim, tag byte included.
                let _ = self.packet_tx.send(Bytes::from(content)).await;
                Ok(())
            }
            Err(e @ Error::UnexpectedPacket { .. }) => {
                // A handshake message that is invalid for our role or the
                // current state drops the connection.
                self.close_later();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Handles an ACK packet.
    async fn handle_ack(&self, data: &[u8]) -> Result<()> {
        let mut ack = Acknowledgement::new();
        ack.read(data)?;

        let mut state = self.state.lock().await;
        for seq in ack.packets {
            // Stale or duplicate acknowledgements fall through silently.
            state.retransmission.acknowledge(seq);
        }

        Ok(())
    }

    /// Handles a NACK packet.
    async fn handle_nack(&self, data: &[u8]) -> Result<()> {
        let mut nack = Acknowledgement::new();
        nack.read(data)?;

        let mut state = self.state.lock().await;

        for seq in nack.packets {
            if let Some(record) = state.retransmission.retransmit(seq) {
                let new_seq = state.seq.inc();

                let mut buf = Vec::with_capacity(128);
                buf.push(BIT_FLAG_DATAGRAM);
                write_uint24(&mut buf, new_seq);
                record.packet.write(&mut buf);
                Self::seal_frame(&mut buf);

                // Requested retransmissions keep their retry count; only
                // backoff-driven resends count against the limit.
                state
                    .retransmission
                    .add_with_retries(new_seq, record.packet, record.retries);

                let _ = self.send_tx.try_send(Bytes::from(buf));
            }
        }

        Ok(())
    }

    /// Sends an ACK for the given sequence numbers.
    async fn send_ack(&self, packets: &[Uint24]) -> Result<()> {
        let mut buf = self.ack_buf.lock().await;
        self.send_acknowledgement(packets, BIT_FLAG_ACK, &mut buf)
            .await
    }

    /// Sends a NACK for the given sequence numbers.
    async fn send_nack(&self, packets: &[Uint24]) -> Result<()> {
        let mut buf = self.nack_buf.lock().await;
        self.send_acknowledgement(packets, BIT_FLAG_NACK, &mut buf)
            .await
    }

    /// Sends an acknowledgement packet with the given packets and bitflag.
    /// Handles splitting into multiple packets if needed.
    async fn send_acknowledgement(
        &self,
        packets: &[Uint24],
        bitflag: u8,
        buf: &mut Vec<u8>,
    ) -> Result<()> {
        let mut ack = Acknowledgement::with_packets(packets.to_vec());
        let mtu = self.effective_mtu();

        while !ack.packets.is_empty() {
            buf.clear();
            buf.push(bitflag | BIT_FLAG_DATAGRAM);

            let n = ack.write_to_buf(buf, mtu);

            // Remove the packets we managed to write
            ack.packets = ack.packets.split_off(n);

            Self::seal_frame(buf);
            let _ = self.send_tx.send(Bytes::copy_from_slice(buf)).await;
        }

        buf.clear();
        Ok(())
    }

    /// Flushes pending ACKs.
    async fn flush_acks(&self) {
        let packets: Vec<Uint24> = {
            let mut state = self.state.lock().await;
            if state.ack_slice.is_empty() {
                return;
            }
            std::mem::take(&mut state.ack_slice)
        };

        let _ = self.send_ack(&packets).await;
    }

    /// Retransmits messages past their backoff deadline; declares the
    /// connection lost once a message exhausts its retries.
    async fn check_resend(&self, now: Instant) {
        let mut exhausted = false;

        {
            let mut state = self.state.lock().await;

            let rtt = state.retransmission.rtt(now);
            self.rtt.store(rtt.as_nanos() as i64, Ordering::Relaxed);
            let base_rto = self.settings.base_rto.max(rtt + rtt / 2);

            let due = state.retransmission.due(now, base_rto);

            for seq in due {
                if let Some(record) = state.retransmission.retransmit(seq) {
                    if record.retries >= self.settings.max_retries {
                        exhausted = true;
                        state.retransmission.clear();
                        break;
                    }

                    let new_seq = state.seq.inc();

                    let mut buf = Vec::with_capacity(128);
                    buf.push(BIT_FLAG_DATAGRAM);
                    write_uint24(&mut buf, new_seq);
                    record.packet.write(&mut buf);
                    Self::seal_frame(&mut buf);

                    state.retransmission.add_with_retries(
                        new_seq,
                        record.packet,
                        record.retries + 1,
                    );

                    let _ = self.send_tx.try_send(Bytes::from(buf));
                }
            }
        }

        if exhausted {
            tracing::debug!(
                peer = %self.remote_addr,
                retries = self.settings.max_retries,
                "reliable message exhausted retries, dropping connection"
            );
            self.close_with(DisconnectReason::RetriesExhausted);
        }
    }

    /// Main tick loop for the connection.
    async fn start_ticking(self: Arc<Self>) {
        let mut interval = time::interval(Duration::from_millis(100));
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick_count += 1;

                    self.flush_acks().await;

                    if tick_count % 3 == 0 {
                        self.check_resend(Instant::now()).await;
                    }

                    let closing_time = self.closing.load(Ordering::Relaxed);
                    if closing_time != 0 {
                        let acks_left = {
                            let state = self.state.lock().await;
                            state.retransmission.pending()
                        };

                        let now = std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .unwrap_or_default()
                            .as_secs() as i64;
                        let since = Duration::from_secs((now - closing_time).max(0) as u64);

                        if (acks_left == 0 && since > Duration::from_secs(1))
                            || since > Duration::from_secs(5)
                        {
                            self.send_disconnect_notification().await;
                            self.close_with(DisconnectReason::Local);
                            return;
                        }
                        continue;
                    }

                    if tick_count % 5 == 0 {
                        // Keep the activity window open and sample RTT.
                        let ping = InternalPing::new(timestamp());
                        let _ = self.send_message(&ping.write(self.table()));

                        let last_activity = *self.last_activity.read();
                        if Instant::now().duration_since(last_activity) > self.settings.timeout {
                            self.close_with(DisconnectReason::TimedOut);
                            return;
                        }
                    }
                }
                _ = self.cancel_notify.notified() => {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::DialerConnectionHandler;
    use crate::tags::ProtocolVersion;

    async fn test_conn() -> Arc<Conn> {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = socket.local_addr().unwrap();
        let table = Arc::new(TagTable::new(ProtocolVersion::V4045).unwrap());
        Conn::new(
            socket,
            remote,
            Arc::new(DialerConnectionHandler),
            ConnSettings::new(table),
        )
    }

    #[tokio::test]
    async fn test_connection_lost_emitted_once() {
        let conn = test_conn().await;

        conn.close_with(DisconnectReason::TimedOut);
        conn.close_with(DisconnectReason::TimedOut);
        conn.close_with(DisconnectReason::RetriesExhausted);

        match conn.next_event().await {
            Some(Event::ConnectionLost { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::TimedOut);
            }
            other => panic!("expected connection lost, got {other:?}"),
        }

        // No second terminal event.
        let extra = time::timeout(Duration::from_millis(100), conn.next_event()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_write_requires_connected_state() {
        let conn = test_conn().await;
        assert!(matches!(
            conn.write(&[0xFE, 1, 2, 3]).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_frame_integrity_check() {
        let conn = test_conn().await;

        let mut frame = vec![BIT_FLAG_DATAGRAM, 0, 0, 0, 1, 2, 3];
        Conn::seal_frame(&mut frame);
        assert!(conn.verify_frame(&frame).is_ok());

        frame[4] ^= 0xFF;
        assert!(matches!(
            conn.verify_frame(&frame),
            Err(Error::ModifiedPacket)
        ));
    }

    #[tokio::test]
    async fn test_tampered_frame_drops_connection() {
        let conn = test_conn().await;

        let mut frame = vec![BIT_FLAG_DATAGRAM, 0, 0, 0, 9, 9];
        Conn::seal_frame(&mut frame);
        frame[4] ^= 0xFF;

        assert!(conn.receive(&frame).await.is_err());
        assert_eq!(conn.state(), ConnectionState::Closed);

        match conn.next_event().await {
            Some(Event::ModifiedPacket { .. }) => {}
            other => panic!("expected modified packet event, got {other:?}"),
        }
        match conn.next_event().await {
            Some(Event::ConnectionLost { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::ModifiedPacket);
            }
            other => panic!("expected connection lost, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_silence_past_timeout_drops_connection() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let remote = socket.local_addr().unwrap();
        let table = Arc::new(TagTable::new(ProtocolVersion::V4045).unwrap());
        let mut settings = ConnSettings::new(table);
        settings.timeout = Duration::from_millis(200);
        let conn = Conn::new(socket, remote, Arc::new(DialerConnectionHandler), settings);

        conn.transition(ConnectionState::ConnectionRequested).unwrap();
        conn.transition(ConnectionState::ConnectionPendingAck)
            .unwrap();
        conn.mark_connected().unwrap();

        // No traffic arrives; the tick loop has to notice the silence.
        let lost = async {
            loop {
                match conn.next_event().await {
                    Some(Event::ConnectionLost { reason, .. }) => return reason,
                    Some(_) => continue,
                    None => panic!("event channel closed without a connection lost"),
                }
            }
        };
        let reason = time::timeout(Duration::from_secs(3), lost).await.unwrap();
        assert_eq!(reason, DisconnectReason::TimedOut);
        assert_eq!(conn.state(), ConnectionState::Closed);

        // Only one terminal event.
        let extra = time::timeout(Duration::from_millis(200), conn.next_event()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_unassigned_tag_dropped_without_event() {
        let conn = test_conn().await;
        conn.transition(ConnectionState::ConnectionRequested).unwrap();
        conn.transition(ConnectionState::ConnectionPendingAck)
            .unwrap();
        conn.mark_connected().unwrap();

        match conn.next_event().await {
            Some(Event::Connected { .. }) => {}
            other => panic!("expected connected event, got {other:?}"),
        }

        // A tag below the user boundary with no assigned meaning.
        let tag = (0..conn.table().user_start())
            .find(|t| conn.table().kind(*t).is_none())
            .unwrap();

        let pk = Packet {
            reliability: Reliability::Unreliable,
            content: vec![tag],
            ..Default::default()
        };
        let mut frame = vec![BIT_FLAG_DATAGRAM, 0, 0, 0];
        pk.write(&mut frame);
        Conn::seal_frame(&mut frame);

        conn.receive(&frame).await.unwrap();

        // Dropped silently: no event, no payload, state unchanged.
        assert_eq!(conn.state(), ConnectionState::Connected);
        let event = time::timeout(Duration::from_millis(100), conn.next_event()).await;
        assert!(event.is_err());
        let payload = time::timeout(Duration::from_millis(100), conn.read_packet()).await;
        assert!(payload.is_err());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let conn = test_conn().await;
        assert!(matches!(
            conn.transition(ConnectionState::Connected),
            Err(Error::IllegalTransition { .. })
        ));
        assert_eq!(conn.state(), ConnectionState::Unconnected);
    }
}
