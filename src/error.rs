//! Error types for the transport.

use thiserror::Error;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for transport operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A message sent was larger than the buffer used to receive the message into.
    #[error("a message sent was larger than the buffer used to receive the message into")]
    BufferTooSmall,

    /// The listener has been closed.
    #[error("use of closed listener")]
    ListenerClosed,

    /// The connection has been closed.
    #[error("use of closed connection")]
    ConnectionClosed,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected end of file.
    #[error("unexpected end of file")]
    UnexpectedEof,

    /// Invalid packet length.
    #[error("invalid packet length: {0}")]
    InvalidPacketLength(String),

    /// Maximum acknowledgement packets exceeded.
    #[error("maximum amount of packets in acknowledgement exceeded")]
    MaxAcknowledgement,

    /// Protocol version mismatch between the two endpoints.
    #[error("mismatched protocol: local revision = {local}, remote revision = {remote}")]
    ProtocolMismatch { local: u16, remote: u16 },

    /// A tag table failed validation at startup.
    #[error("invalid tag table for revision {version}: conflicting tag {tag:#x}")]
    InvalidTagTable { version: u16, tag: u8 },

    /// Connection timeout.
    #[error("connection timed out")]
    Timeout,

    /// A lifecycle transition that the state machine forbids.
    #[error("illegal connection state transition: {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The remote requires a password and ours did not match.
    #[error("invalid password")]
    InvalidPassword,

    /// Our address is banned on the remote.
    #[error("connection banned")]
    ConnectionBanned,

    /// The remote is not accepting new connections.
    #[error("no free incoming connections")]
    NoFreeIncomingConnections,

    /// A datagram failed its integrity check.
    #[error("modified packet: checksum mismatch")]
    ModifiedPacket,

    /// Queue window size too big.
    #[error("queue window size is too big ({lowest}-{highest})")]
    WindowSizeTooBig { lowest: u32, highest: u32 },

    /// Split packet error.
    #[error("split packet error: {0}")]
    SplitPacket(String),

    /// Zero packet length.
    #[error("handle packet: zero packet length")]
    ZeroPacket,

    /// A handshake message arrived that is invalid for the current role or state.
    #[error("unexpected {packet_type} packet in state {state}")]
    UnexpectedPacket {
        packet_type: &'static str,
        state: &'static str,
    },

    /// Unknown offline packet.
    #[error("unknown unconnected packet (id={id:#x}, len={len})")]
    UnknownPacket { id: u8, len: usize },

    /// Generic error with message.
    #[error("{0}")]
    Other(String),

    /// Timestamp in the future.
    #[error("timestamp is in the future")]
    TimestampInFuture,
}
