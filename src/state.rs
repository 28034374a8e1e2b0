//! Per-peer connection lifecycle.

use std::fmt;

/// Lifecycle state of a peer connection.
///
/// A peer reaches [`ConnectionState::Connected`] only through the full
/// four-message handshake: open-connection-request, open-connection-reply,
/// connection-request, connection-request-accepted. `Closed` and `Banned`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake traffic exchanged yet.
    Unconnected,
    /// The open-connection exchange is in flight.
    ConnectionRequested,
    /// The connection-request/accept exchange is in flight.
    ConnectionPendingAck,
    /// Fully established; user data may flow.
    Connected,
    /// Graceful close requested, draining pending reliable messages.
    Disconnecting,
    /// The peer is banned. Terminal.
    Banned,
    /// The connection is closed. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Banned)
    }

    /// Whether user payloads may be sent in this state.
    pub fn allows_user_data(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Any non-terminal state may close (timeout, tamper detection and retry
    /// exhaustion all force `Closed`); the forward path through the handshake
    /// is strictly ordered.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Unconnected => false,
            ConnectionRequested => self == Unconnected,
            ConnectionPendingAck => self == ConnectionRequested,
            Connected => self == ConnectionPendingAck,
            Disconnecting => self == Connected,
            Banned | Closed => true,
        }
    }

    /// Short name used in errors and logs.
    pub fn name(self) -> &'static str {
        match self {
            ConnectionState::Unconnected => "unconnected",
            ConnectionState::ConnectionRequested => "connection-requested",
            ConnectionState::ConnectionPendingAck => "connection-pending-ack",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Banned => "banned",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_handshake_path() {
        assert!(Unconnected.can_transition_to(ConnectionRequested));
        assert!(ConnectionRequested.can_transition_to(ConnectionPendingAck));
        assert!(ConnectionPendingAck.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(Disconnecting.can_transition_to(Closed));
    }

    #[test]
    fn test_no_skipping_handshake_phases() {
        assert!(!Unconnected.can_transition_to(Connected));
        assert!(!Unconnected.can_transition_to(ConnectionPendingAck));
        assert!(!ConnectionRequested.can_transition_to(Connected));
    }

    #[test]
    fn test_any_live_state_can_close() {
        for state in [
            Unconnected,
            ConnectionRequested,
            ConnectionPendingAck,
            Connected,
            Disconnecting,
        ] {
            assert!(state.can_transition_to(Closed));
            assert!(state.can_transition_to(Banned));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(Closed.is_terminal());
        assert!(Banned.is_terminal());
        assert!(!Closed.can_transition_to(ConnectionRequested));
        assert!(!Banned.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Closed));
    }
}
