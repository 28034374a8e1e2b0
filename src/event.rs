//! Events surfaced to the application.

use std::net::SocketAddr;

/// Why a connection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a disconnection notification.
    Notified,
    /// No traffic within the timeout window.
    TimedOut,
    /// A reliable message exhausted its retries.
    RetriesExhausted,
    /// A datagram failed its integrity check.
    ModifiedPacket,
    /// We closed locally.
    Local,
}

/// A lifecycle event for one peer.
///
/// User payloads are not events; they are read from the connection directly.
/// Each terminal event is emitted at most once per connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed and the peer is fully connected.
    Connected { peer: SocketAddr },
    /// The peer disconnected gracefully.
    DisconnectionNotification { peer: SocketAddr },
    /// The connection was lost without a graceful close.
    ConnectionLost {
        peer: SocketAddr,
        reason: DisconnectReason,
    },
    /// A message from the peer was modified in transit. Followed by a
    /// `ConnectionLost` with [`DisconnectReason::ModifiedPacket`].
    ModifiedPacket { peer: SocketAddr },
    /// The peer's static data arrived or changed.
    StaticDataReceived { peer: SocketAddr, data: Vec<u8> },
}

impl Event {
    /// The remote endpoint this event concerns.
    pub fn peer(&self) -> SocketAddr {
        match self {
            Event::Connected { peer }
            | Event::DisconnectionNotification { peer }
            | Event::ConnectionLost { peer, .. }
            | Event::ModifiedPacket { peer }
            | Event::StaticDataReceived { peer, .. } => *peer,
        }
    }
}
