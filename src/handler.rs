//! Role-specific handling of handshake messages.
//!
//! The reliability layer and dispatcher are identical on both ends of a
//! connection; the asymmetry of the handshake lives behind the
//! [`ConnectionHandler`] trait. The listener validates connection requests
//! and the dialer reacts to their outcome.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::message as msg;
use crate::state::ConnectionState;
use crate::tags::MessageKind;
use crate::timestamp;

/// Handles messages the dispatcher does not consume itself, in particular
/// the handshake messages whose meaning depends on the endpoint's role.
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    /// Handles one transport message. Returns whether the message was
    /// recognized; unrecognized messages are dropped by the dispatcher.
    fn handle(&self, conn: &Conn, kind: MessageKind, body: &[u8]) -> Result<bool>;

    /// Whether resource limits (window sizes, split counts) are enforced.
    /// Servers enforce them; clients trust their server.
    fn limits_enabled(&self) -> bool;

    /// Called once when the connection stops.
    fn close(&self, conn: &Conn);
}

/// The server side of the handshake.
pub(crate) struct ListenerConnectionHandler {
    /// Connection password required of every client. Empty means open access.
    pub password: Vec<u8>,

    /// Maximum number of simultaneously connected clients.
    pub max_connections: usize,

    /// Live connections, shared with the listener.
    pub connections: Arc<RwLock<HashMap<SocketAddr, Arc<Conn>>>>,
}

impl ConnectionHandler for ListenerConnectionHandler {
    fn handle(&self, conn: &Conn, kind: MessageKind, body: &[u8]) -> Result<bool> {
        match kind {
            MessageKind::ConnectionRequest => {
                if conn.state() != ConnectionState::ConnectionRequested {
                    return Err(Error::UnexpectedPacket {
                        packet_type: "connection request",
                        state: conn.state().name(),
                    });
                }

                let request = msg::ConnectionRequest::read(body)?;

                if request.password != self.password {
                    tracing::debug!(peer = %conn.remote_addr(), "rejecting connection: wrong password");
                    let tag = conn.table().tag(MessageKind::InvalidPassword);
                    conn.send_message(&[tag])?;
                    conn.reject(Error::InvalidPassword);
                    return Ok(true);
                }

                if self.connections.read().len() > self.max_connections {
                    tracing::debug!(peer = %conn.remote_addr(), "rejecting connection: at capacity");
                    let tag = conn.table().tag(MessageKind::NoFreeIncomingConnections);
                    conn.send_message(&[tag])?;
                    conn.reject(Error::NoFreeIncomingConnections);
                    return Ok(true);
                }

                conn.transition(ConnectionState::ConnectionPendingAck)?;
                let accepted = msg::ConnectionRequestAccepted::new(
                    conn.remote_addr(),
                    0,
                    request.request_time,
                    timestamp(),
                );
                conn.send_message(&accepted.write(conn.table()))?;
                Ok(true)
            }
            MessageKind::NewIncomingConnection => {
                if conn.state() != ConnectionState::ConnectionPendingAck {
                    return Err(Error::UnexpectedPacket {
                        packet_type: "new incoming connection",
                        state: conn.state().name(),
                    });
                }

                msg::NewIncomingConnection::read(body)?;
                conn.mark_connected()?;
                Ok(true)
            }
            MessageKind::ConnectionRequestAccepted
            | MessageKind::InvalidPassword
            | MessageKind::ConnectionBanned
            | MessageKind::NoFreeIncomingConnections => {
                // Client-directed messages are never valid towards a server.
                Err(Error::UnexpectedPacket {
                    packet_type: "client-directed handshake",
                    state: conn.state().name(),
                })
            }
            _ => Ok(false),
        }
    }

    fn limits_enabled(&self) -> bool {
        true
    }

    fn close(&self, conn: &Conn) {
        self.connections.write().remove(&conn.remote_addr());
    }
}

/// The client side of the handshake.
pub(crate) struct DialerConnectionHandler;

impl ConnectionHandler for DialerConnectionHandler {
    fn handle(&self, conn: &Conn, kind: MessageKind, body: &[u8]) -> Result<bool> {
        match kind {
            MessageKind::ConnectionRequestAccepted => {
                if conn.state() != ConnectionState::ConnectionPendingAck {
                    return Err(Error::UnexpectedPacket {
                        packet_type: "connection request accepted",
                        state: conn.state().name(),
                    });
                }

                let accepted = msg::ConnectionRequestAccepted::read(body)?;

                let confirm = msg::NewIncomingConnection::new(
                    conn.remote_addr(),
                    accepted.request_time,
                    accepted.accept_time,
                );
                conn.send_message(&confirm.write(conn.table()))?;
                conn.mark_connected()?;
                Ok(true)
            }
            MessageKind::InvalidPassword => {
                conn.reject(Error::InvalidPassword);
                Ok(true)
            }
            MessageKind::ConnectionBanned => {
                conn.reject(Error::ConnectionBanned);
                Ok(true)
            }
            MessageKind::NoFreeIncomingConnections => {
                conn.reject(Error::NoFreeIncomingConnections);
                Ok(true)
            }
            MessageKind::ConnectionRequest | MessageKind::NewIncomingConnection => {
                // Server-directed messages are never valid towards a client.
                Err(Error::UnexpectedPacket {
                    packet_type: "server-directed handshake",
                    state: conn.state().name(),
                })
            }
            _ => Ok(false),
        }
    }

    fn limits_enabled(&self) -> bool {
        false
    }

    fn close(&self, _conn: &Conn) {}
}
