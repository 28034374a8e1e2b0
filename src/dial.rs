//! Client side of the transport: opens a connection to a listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::time;

use crate::conn::{Conn, ConnSettings};
use crate::error::{Error, Result};
use crate::handler::DialerConnectionHandler;
use crate::message as msg;
use crate::state::ConnectionState;
use crate::tags::{MessageKind, ProtocolVersion, TagTable};
use crate::{timestamp, MAX_MTU_SIZE};

/// Attempts made during the open-connection exchange before giving up.
const OPEN_CONNECTION_ATTEMPTS: u32 = 3;

/// How long each open-connection attempt waits for a reply.
const OPEN_CONNECTION_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for dialing a listener.
#[derive(Debug, Clone)]
pub struct Dialer {
    /// Protocol revision to speak. Must match the listener's.
    pub version: ProtocolVersion,

    /// Connection password presented to the listener.
    pub password: Vec<u8>,

    /// MTU proposed during the open-connection exchange.
    pub mtu: u16,

    /// How long the full handshake may take before the dial fails.
    pub timeout: Duration,

    /// Per-connection inactivity timeout once established.
    pub conn_timeout: Duration,

    /// Base retransmission timeout for reliable messages.
    pub base_rto: Duration,

    /// Retransmissions allowed per reliable message.
    pub max_retries: u32,

    /// Static data blob pushed to the listener after connecting.
    pub static_data: Vec<u8>,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4045,
            password: Vec::new(),
            mtu: MAX_MTU_SIZE,
            timeout: Duration::from_secs(10),
            conn_timeout: Duration::from_secs(10),
            base_rto: Duration::from_millis(100),
            max_retries: 8,
            static_data: Vec::new(),
        }
    }
}

impl Dialer {
    /// Dials the listener at `addr` and completes the full handshake.
    pub async fn dial<A: ToSocketAddrs>(self, addr: A) -> Result<Arc<Conn>> {
        let remote_addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::Other("no addresses resolved".to_string()))?;

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let table = Arc::new(TagTable::new(self.version)?);

        let reply = self.open_connection(&socket, &table, remote_addr).await?;

        let settings = ConnSettings {
            table: Arc::clone(&table),
            mtu: reply.mtu,
            timeout: self.conn_timeout,
            base_rto: self.base_rto,
            max_retries: self.max_retries,
            static_data: self.static_data.clone(),
        };
        let conn = Conn::new(
            Arc::clone(&socket),
            remote_addr,
            Arc::new(DialerConnectionHandler),
            settings,
        );
        conn.transition(ConnectionState::ConnectionRequested)?;

        Self::spawn_recv_loop(Arc::clone(&socket), Arc::clone(&conn));

        let request =
            msg::ConnectionRequest::new(rand::rng().random(), timestamp(), self.password.clone());
        conn.send_message(&request.write(&table))?;
        conn.transition(ConnectionState::ConnectionPendingAck)?;

        if time::timeout(self.timeout, conn.wait_connected())
            .await
            .is_err()
        {
            conn.close_later();
            return Err(Error::Timeout);
        }

        if !conn.is_connected() {
            // Woken by a rejection rather than by the handshake completing.
            return Err(conn.take_reject_reason().unwrap_or(Error::Timeout));
        }

        Ok(conn)
    }

    /// Runs the offline open-connection exchange.
    async fn open_connection(
        &self,
        socket: &UdpSocket,
        table: &TagTable,
        remote_addr: SocketAddr,
    ) -> Result<msg::OpenConnectionReply> {
        let request = msg::OpenConnectionRequest::new(self.version.id(), self.mtu);
        let mut buf = [0u8; MAX_MTU_SIZE as usize];

        for attempt in 0..OPEN_CONNECTION_ATTEMPTS {
            socket.send_to(&request.write(table), remote_addr).await?;

            let received =
                time::timeout(OPEN_CONNECTION_REPLY_TIMEOUT, socket.recv_from(&mut buf)).await;

            let (n, from) = match received {
                Ok(pair) => pair?,
                Err(_) => {
                    tracing::debug!(attempt, "open connection attempt timed out");
                    continue;
                }
            };
            if from != remote_addr || n == 0 {
                continue;
            }

            match table.kind(buf[0]) {
                Some(MessageKind::OpenConnectionReply) => {
                    return msg::OpenConnectionReply::read(&buf[1..n]);
                }
                Some(MessageKind::ConnectionBanned) => {
                    return Err(Error::ConnectionBanned);
                }
                _ => continue,
            }
        }

        Err(Error::Timeout)
    }

    /// Spawns the socket read loop feeding the connection.
    fn spawn_recv_loop(socket: Arc<UdpSocket>, conn: Arc<Conn>) {
        let cancel = conn.get_cancel_notify();

        tokio::spawn(async move {
            let mut buf = [0u8; MAX_MTU_SIZE as usize];

            loop {
                tokio::select! {
                    received = socket.recv_from(&mut buf) => {
                        let (n, from) = match received {
                            Ok(pair) => pair,
                            Err(e) => {
                                tracing::debug!("dialer socket read failed: {e}");
                                return;
                            }
                        };
                        if from != conn.remote_addr() {
                            continue;
                        }
                        if let Err(e) = conn.receive(&buf[..n]).await {
                            tracing::debug!(peer = %from, "dropping datagram: {e}");
                        }
                    }
                    _ = cancel.notified() => {
                        return;
                    }
                }
            }
        });
    }

    /// Sends an unconnected ping to `addr` and returns the pong data.
    pub async fn ping<A: ToSocketAddrs>(&self, addr: A) -> Result<Vec<u8>> {
        let remote_addr = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| Error::Other("no addresses resolved".to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let table = TagTable::new(self.version)?;

        let ping = msg::UnconnectedPing::new(timestamp(), rand::rng().random());
        let mut buf = [0u8; MAX_MTU_SIZE as usize];

        for _ in 0..OPEN_CONNECTION_ATTEMPTS {
            socket.send_to(&ping.write(&table), remote_addr).await?;

            let received =
                time::timeout(OPEN_CONNECTION_REPLY_TIMEOUT, socket.recv_from(&mut buf)).await;

            let (n, from) = match received {
                Ok(pair) => pair?,
                Err(_) => continue,
            };
            if from != remote_addr || n == 0 {
                continue;
            }

            if table.kind(buf[0]) == Some(MessageKind::UnconnectedPong) {
                let pong = msg::UnconnectedPong::read(&buf[1..n])?;
                return Ok(pong.data);
            }
        }

        Err(Error::Timeout)
    }
}
