//! Server side of the transport: accepts incoming connections over one UDP
//! socket.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;

use crate::conn::{Conn, ConnSettings};
use crate::error::{Error, Result};
use crate::handler::ListenerConnectionHandler;
use crate::message as msg;
use crate::packet::BIT_FLAG_DATAGRAM;
use crate::state::ConnectionState;
use crate::tags::{MessageKind, ProtocolVersion, TagTable};
use crate::{MAX_MTU_SIZE, MIN_MTU_SIZE};

/// How long an address stays blocked after misbehaving.
const BLOCK_DURATION: Duration = Duration::from_secs(10);

/// Interval at which expired blocks and bans are collected.
const BLOCK_GC_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for a [`Listener`].
#[derive(Debug, Clone)]
pub struct ListenConfig {
    /// Protocol revision this listener speaks. Clients on a different
    /// revision are rejected during the open-connection exchange.
    pub version: ProtocolVersion,

    /// Password required of connecting clients. Empty means open access.
    pub password: Vec<u8>,

    /// Maximum number of simultaneously connected clients.
    pub max_connections: usize,

    /// Per-connection inactivity timeout.
    pub timeout: Duration,

    /// Base retransmission timeout for reliable messages.
    pub base_rto: Duration,

    /// Retransmissions allowed per reliable message.
    pub max_retries: u32,

    /// Static data blob pushed to every client after connecting.
    pub static_data: Vec<u8>,

    /// Data returned in answer to unconnected pings, for server enumeration.
    pub pong_data: Vec<u8>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4045,
            password: Vec::new(),
            max_connections: 4096,
            timeout: Duration::from_secs(10),
            base_rto: Duration::from_millis(100),
            max_retries: 8,
            static_data: Vec::new(),
            pong_data: Vec::new(),
        }
    }
}

/// A transport listener bound to a UDP socket.
pub struct Listener {
    /// The UDP socket all connections share.
    socket: Arc<UdpSocket>,

    /// Randomized server GUID, sent in open-connection replies and pongs.
    id: i64,

    /// The tag table for the configured protocol revision.
    table: Arc<TagTable>,

    /// Channel of fully connected clients for [`Listener::accept`].
    incoming: mpsc::Receiver<Arc<Conn>>,

    /// Whether the listener stopped.
    closed: Arc<AtomicBool>,

    /// Live connections keyed by remote address.
    connections: Arc<RwLock<HashMap<SocketAddr, Arc<Conn>>>>,

    /// Banned addresses and their expiry (None means permanent).
    banned: Arc<RwLock<HashMap<IpAddr, Option<Instant>>>>,
}

impl Listener {
    /// Listens on the given address with default configuration.
    pub async fn listen<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::listen_with(addr, ListenConfig::default()).await
    }

    /// Listens on the given address.
    pub async fn listen_with<A: ToSocketAddrs>(addr: A, config: ListenConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let table = Arc::new(TagTable::new(config.version)?);
        let (incoming_tx, incoming) = mpsc::channel(128);

        let listener = Self {
            socket: Arc::clone(&socket),
            id: rand::rng().random(),
            table: Arc::clone(&table),
            incoming,
            closed: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(RwLock::new(HashMap::new())),
            banned: Arc::new(RwLock::new(HashMap::new())),
        };

        let worker = ListenerWorker {
            socket,
            id: listener.id,
            table,
            config,
            incoming_tx,
            closed: Arc::clone(&listener.closed),
            connections: Arc::clone(&listener.connections),
            banned: Arc::clone(&listener.banned),
            blocked: HashMap::new(),
            last_gc: Instant::now(),
        };
        tokio::spawn(worker.run());

        Ok(listener)
    }

    /// Waits for the next fully connected client.
    pub async fn accept(&mut self) -> Result<Arc<Conn>> {
        self.incoming.recv().await.ok_or(Error::ListenerClosed)
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }

    /// Returns the server GUID.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Returns the number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    /// Bans an address for `duration`, or permanently when `None`. An
    /// existing connection from the address is dropped immediately.
    pub fn ban(&self, ip: IpAddr, duration: Option<Duration>) {
        self.banned
            .write()
            .insert(ip, duration.map(|d| Instant::now() + d));

        let conns: Vec<Arc<Conn>> = self
            .connections
            .read()
            .iter()
            .filter(|(addr, _)| addr.ip() == ip)
            .map(|(_, conn)| Arc::clone(conn))
            .collect();
        for conn in conns {
            let tag = self.table.tag(MessageKind::ConnectionBanned);
            let _ = conn.send_message(&[tag]);
            conn.ban();
        }
    }

    /// Lifts a ban.
    pub fn unban(&self, ip: IpAddr) {
        self.banned.write().remove(&ip);
    }

    /// Whether the address is currently banned.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        match self.banned.read().get(&ip) {
            Some(None) => true,
            Some(Some(expiry)) => Instant::now() < *expiry,
            None => false,
        }
    }

    /// Stops the listener and closes every connection.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let conns: Vec<Arc<Conn>> = self.connections.read().values().cloned().collect();
        for conn in conns {
            let _ = conn.close().await;
        }
    }
}

/// The socket read loop and offline message handling, detached from the
/// [`Listener`] handle so `accept` and the loop never contend.
struct ListenerWorker {
    socket: Arc<UdpSocket>,
    id: i64,
    table: Arc<TagTable>,
    config: ListenConfig,
    incoming_tx: mpsc::Sender<Arc<Conn>>,
    closed: Arc<AtomicBool>,
    connections: Arc<RwLock<HashMap<SocketAddr, Arc<Conn>>>>,
    banned: Arc<RwLock<HashMap<IpAddr, Option<Instant>>>>,
    /// Addresses temporarily ignored after protocol violations.
    blocked: HashMap<IpAddr, Instant>,
    last_gc: Instant,
}

impl ListenerWorker {
    async fn run(mut self) {
        let mut buf = [0u8; MAX_MTU_SIZE as usize];

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let (n, addr) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!("listener socket read failed: {e}");
                    return;
                }
            };

            if self.last_gc.elapsed() > BLOCK_GC_INTERVAL {
                self.gc_blocks();
            }

            if let Some(until) = self.blocked.get(&addr.ip()) {
                if Instant::now() < *until {
                    continue;
                }
                self.blocked.remove(&addr.ip());
            }

            if let Err(e) = self.handle(&buf[..n], addr).await {
                tracing::debug!(peer = %addr, "dropping datagram: {e}");
            }
        }
    }

    async fn handle(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        if data[0] & BIT_FLAG_DATAGRAM != 0 {
            let conn = self.connections.read().get(&addr).cloned();
            return match conn {
                Some(conn) => conn.receive(data).await,
                // Connected traffic from an unknown peer, dropped.
                None => Ok(()),
            };
        }

        self.handle_offline(data, addr).await
    }

    /// Handles an offline (unconnected) message.
    async fn handle_offline(&mut self, data: &[u8], addr: SocketAddr) -> Result<()> {
        let kind = match self.table.kind(data[0]) {
            Some(kind) => kind,
            None => {
                return Err(Error::UnknownPacket {
                    id: data[0],
                    len: data.len(),
                })
            }
        };
        let body = &data[1..];

        match kind {
            MessageKind::UnconnectedPing => {
                let ping = msg::UnconnectedPing::read(body)?;
                self.send_pong(ping.ping_time, addr).await
            }
            MessageKind::UnconnectedPingOpenConnections => {
                let ping = msg::UnconnectedPing::read(body)?;
                if self.connections.read().len() >= self.config.max_connections {
                    return Ok(());
                }
                self.send_pong(ping.ping_time, addr).await
            }
            MessageKind::OpenConnectionRequest => {
                self.handle_open_connection_request(body, addr).await
            }
            _ => Err(Error::UnknownPacket {
                id: data[0],
                len: data.len(),
            }),
        }
    }

    async fn send_pong(&self, ping_time: i64, addr: SocketAddr) -> Result<()> {
        let pong = msg::UnconnectedPong::new(ping_time, self.id, self.config.pong_data.clone());
        self.socket.send_to(&pong.write(&self.table), addr).await?;
        Ok(())
    }

    async fn handle_open_connection_request(
        &mut self,
        body: &[u8],
        addr: SocketAddr,
    ) -> Result<()> {
        let request = msg::OpenConnectionRequest::read(body)?;

        if self.is_banned(addr.ip()) {
            let tag = self.table.tag(MessageKind::ConnectionBanned);
            self.socket.send_to(&[tag], addr).await?;
            return Ok(());
        }

        if request.version_id != self.table.version().id() {
            self.block(addr.ip());
            return Err(Error::ProtocolMismatch {
                local: self.table.version().id(),
                remote: request.version_id,
            });
        }

        let mtu = request.mtu.clamp(MIN_MTU_SIZE, MAX_MTU_SIZE);
        let reply = msg::OpenConnectionReply::new(self.id, mtu);

        if self.connections.read().contains_key(&addr) {
            // The reply was lost; answer again without resetting the session.
            self.socket.send_to(&reply.write(&self.table), addr).await?;
            return Ok(());
        }

        let settings = ConnSettings {
            table: Arc::clone(&self.table),
            mtu,
            timeout: self.config.timeout,
            base_rto: self.config.base_rto,
            max_retries: self.config.max_retries,
            static_data: self.config.static_data.clone(),
        };
        let handler = Arc::new(ListenerConnectionHandler {
            password: self.config.password.clone(),
            max_connections: self.config.max_connections,
            connections: Arc::clone(&self.connections),
        });

        let conn = Conn::new(Arc::clone(&self.socket), addr, handler, settings);
        conn.transition(ConnectionState::ConnectionRequested)?;
        self.connections.write().insert(addr, Arc::clone(&conn));

        self.socket.send_to(&reply.write(&self.table), addr).await?;

        // Hand the connection over once the handshake completes; give up on
        // clients that stall after the open-connection exchange.
        let incoming_tx = self.incoming_tx.clone();
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(10), conn.wait_connected()).await {
                Ok(()) if conn.is_connected() => {
                    let _ = incoming_tx.send(conn).await;
                }
                _ => {
                    tracing::debug!(peer = %conn.remote_addr(), "handshake did not complete");
                    connections.write().remove(&conn.remote_addr());
                    conn.close_later();
                }
            }
        });

        Ok(())
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        match self.banned.read().get(&ip) {
            Some(None) => true,
            Some(Some(expiry)) => Instant::now() < *expiry,
            None => false,
        }
    }

    fn block(&mut self, ip: IpAddr) {
        tracing::debug!(%ip, "blocking address after protocol violation");
        self.blocked.insert(ip, Instant::now() + BLOCK_DURATION);
    }

    fn gc_blocks(&mut self) {
        let now = Instant::now();
        self.blocked.retain(|_, until| *until > now);
        self.banned
            .write()
            .retain(|_, expiry| expiry.map_or(true, |e| e > now));
        self.last_gc = now;
    }
}
