//! Versioned message-tag tables.
//!
//! The first byte of every message names its kind. Three mutually
//! incompatible numberings of the same symbolic set exist, selected by
//! [`ProtocolVersion`] at configuration time. Both endpoints must be built
//! against the same version or received tags are misinterpreted.
//!
//! Every numeric value here is a pinned wire-compatibility constant. They are
//! assigned explicitly per entry and must never be reordered or unified
//! across versions.

use std::fmt;

use crate::error::{Error, Result};

/// The wire protocol revision in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// Revision 8910.
    V8910,
    /// Revision 8935.
    V8935,
    /// Revisions 4045 and 4047 (identical tables).
    V4045,
}

impl ProtocolVersion {
    /// The numeric revision identifier sent during the handshake.
    pub fn id(self) -> u16 {
        match self {
            ProtocolVersion::V8910 => 8910,
            ProtocolVersion::V8935 => 8935,
            ProtocolVersion::V4045 => 4045,
        }
    }

    /// Resolves a numeric revision identifier to a version.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            8910 => Some(ProtocolVersion::V8910),
            8935 => Some(ProtocolVersion::V8935),
            4045 | 4047 => Some(ProtocolVersion::V4045),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// The closed symbolic set of message kinds used by the transport core.
///
/// Kinds marked "local" are never transmitted; their tags exist so the
/// matching event can be surfaced to the application with a stable first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Ping over an established connection. Updates activity timestamps.
    InternalPing,
    /// Ping from an unconnected system. Replied to, timestamps untouched.
    UnconnectedPing,
    /// Unconnected ping answered only while open connections exist.
    UnconnectedPingOpenConnections,
    /// Pong over an established connection.
    ConnectedPong,
    /// The peer asked for our static data.
    RequestStaticData,
    /// Second handshake phase: request to establish a session.
    ConnectionRequest,
    /// Reliable probe to detect lost connections.
    DetectLostConnections,
    /// First handshake phase: offline request to open a connection.
    OpenConnectionRequest,
    /// First handshake phase: offline reply accepting the open request.
    OpenConnectionReply,
    /// Second handshake phase: the connection request was accepted.
    ConnectionRequestAccepted,
    /// Local: a connection attempt could not be completed.
    ConnectionAttemptFailed,
    /// Final handshake message: the client confirms the session.
    NewIncomingConnection,
    /// The remote is not accepting new connections.
    NoFreeIncomingConnections,
    /// The peer disconnected gracefully.
    DisconnectionNotification,
    /// Local: reliable delivery to the peer failed, connection dropped.
    ConnectionLost,
    /// The remote has banned our address.
    ConnectionBanned,
    /// The remote requires a password and ours did not match.
    InvalidPassword,
    /// Local: a message failed integrity verification in transit.
    ModifiedPacket,
    /// Embedded remote timestamp for clock synchronization.
    Timestamp,
    /// Pong from an unconnected system, carries server enumeration data.
    UnconnectedPong,
    /// Static data of the peer.
    ReceivedStaticData,
}

/// All kinds, in declaration order. Used to build and validate tables.
const ALL_KINDS: [MessageKind; 21] = [
    MessageKind::InternalPing,
    MessageKind::UnconnectedPing,
    MessageKind::UnconnectedPingOpenConnections,
    MessageKind::ConnectedPong,
    MessageKind::RequestStaticData,
    MessageKind::ConnectionRequest,
    MessageKind::DetectLostConnections,
    MessageKind::OpenConnectionRequest,
    MessageKind::OpenConnectionReply,
    MessageKind::ConnectionRequestAccepted,
    MessageKind::ConnectionAttemptFailed,
    MessageKind::NewIncomingConnection,
    MessageKind::NoFreeIncomingConnections,
    MessageKind::DisconnectionNotification,
    MessageKind::ConnectionLost,
    MessageKind::ConnectionBanned,
    MessageKind::InvalidPassword,
    MessageKind::ModifiedPacket,
    MessageKind::Timestamp,
    MessageKind::UnconnectedPong,
    MessageKind::ReceivedStaticData,
];

impl MessageKind {
    fn index(self) -> usize {
        ALL_KINDS.iter().position(|&k| k == self).unwrap_or(0)
    }
}

/// Pinned tag assignment for revision 8910. User boundary 92.
const TAGS_8910: [u8; 21] = [
    5,  // InternalPing
    6,  // UnconnectedPing
    7,  // UnconnectedPingOpenConnections
    8,  // ConnectedPong
    10, // RequestStaticData
    11, // ConnectionRequest
    17, // DetectLostConnections
    18, // OpenConnectionRequest
    19, // OpenConnectionReply
    25, // ConnectionRequestAccepted
    26, // ConnectionAttemptFailed
    27, // NewIncomingConnection
    28, // NoFreeIncomingConnections
    29, // DisconnectionNotification
    30, // ConnectionLost
    32, // ConnectionBanned
    33, // InvalidPassword
    34, // ModifiedPacket
    35, // Timestamp
    36, // UnconnectedPong
    37, // ReceivedStaticData
];

/// Pinned tag assignment for revision 8935. User boundary 92.
const TAGS_8935: [u8; 21] = [
    10, // InternalPing
    11, // UnconnectedPing
    12, // UnconnectedPingOpenConnections
    9,  // ConnectedPong
    13, // RequestStaticData
    6,  // ConnectionRequest
    20, // DetectLostConnections
    21, // OpenConnectionRequest
    22, // OpenConnectionReply
    24, // ConnectionRequestAccepted
    25, // ConnectionAttemptFailed
    26, // NewIncomingConnection
    27, // NoFreeIncomingConnections
    28, // DisconnectionNotification
    29, // ConnectionLost
    31, // ConnectionBanned
    32, // InvalidPassword
    33, // ModifiedPacket
    34, // Timestamp
    35, // UnconnectedPong
    36, // ReceivedStaticData
];

/// Pinned tag assignment for revisions 4045/4047. User boundary 80.
const TAGS_4045: [u8; 21] = [
    7,  // InternalPing
    8,  // UnconnectedPing
    9,  // UnconnectedPingOpenConnections
    10, // ConnectedPong
    11, // RequestStaticData
    12, // ConnectionRequest
    24, // DetectLostConnections
    25, // OpenConnectionRequest
    26, // OpenConnectionReply
    33, // ConnectionRequestAccepted
    30, // ConnectionAttemptFailed
    31, // NewIncomingConnection
    32, // NoFreeIncomingConnections
    34, // DisconnectionNotification
    35, // ConnectionLost
    37, // ConnectionBanned
    38, // InvalidPassword
    39, // ModifiedPacket
    41, // Timestamp
    40, // UnconnectedPong
    42, // ReceivedStaticData
];

/// A validated, bidirectional mapping between [`MessageKind`] and the tag
/// byte of one protocol version.
#[derive(Debug, Clone)]
pub struct TagTable {
    version: ProtocolVersion,
    to_tag: [u8; 21],
    from_tag: [Option<MessageKind>; 256],
    user_start: u8,
}

impl TagTable {
    /// Builds the table for the given version.
    ///
    /// Fails if a version assigns the same numeric value to two kinds or
    /// places an internal tag at or above the user boundary.
    pub fn new(version: ProtocolVersion) -> Result<Self> {
        let (to_tag, user_start) = match version {
            ProtocolVersion::V8910 => (TAGS_8910, 92),
            ProtocolVersion::V8935 => (TAGS_8935, 92),
            ProtocolVersion::V4045 => (TAGS_4045, 80),
        };

        let mut from_tag = [None; 256];
        for (i, &tag) in to_tag.iter().enumerate() {
            if tag >= user_start {
                return Err(Error::InvalidTagTable {
                    version: version.id(),
                    tag,
                });
            }
            if from_tag[tag as usize].is_some() {
                return Err(Error::InvalidTagTable {
                    version: version.id(),
                    tag,
                });
            }
            from_tag[tag as usize] = Some(ALL_KINDS[i]);
        }

        Ok(Self {
            version,
            to_tag,
            from_tag,
            user_start,
        })
    }

    /// The version this table encodes.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The numeric tag for a kind under this version.
    pub fn tag(&self, kind: MessageKind) -> u8 {
        self.to_tag[kind.index()]
    }

    /// Resolves a received tag byte to a kind, if it is in range for this
    /// version.
    pub fn kind(&self, tag: u8) -> Option<MessageKind> {
        self.from_tag[tag as usize]
    }

    /// The first tag reserved for application-defined message types.
    pub fn user_start(&self) -> u8 {
        self.user_start
    }

    /// Whether a tag belongs to the application, not the transport core.
    pub fn is_user(&self, tag: u8) -> bool {
        tag >= self.user_start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_versions_validate() {
        for version in [
            ProtocolVersion::V8910,
            ProtocolVersion::V8935,
            ProtocolVersion::V4045,
        ] {
            TagTable::new(version).unwrap();
        }
    }

    #[test]
    fn test_pinned_values() {
        let t = TagTable::new(ProtocolVersion::V8910).unwrap();
        assert_eq!(t.tag(MessageKind::InternalPing), 5);
        assert_eq!(t.tag(MessageKind::OpenConnectionRequest), 18);
        assert_eq!(t.tag(MessageKind::ConnectionRequestAccepted), 25);
        assert_eq!(t.tag(MessageKind::ModifiedPacket), 34);
        assert_eq!(t.user_start(), 92);

        let t = TagTable::new(ProtocolVersion::V8935).unwrap();
        assert_eq!(t.tag(MessageKind::ConnectionRequest), 6);
        assert_eq!(t.tag(MessageKind::ConnectedPong), 9);
        assert_eq!(t.tag(MessageKind::ConnectionRequestAccepted), 24);
        assert_eq!(t.user_start(), 92);

        let t = TagTable::new(ProtocolVersion::V4045).unwrap();
        assert_eq!(t.tag(MessageKind::InternalPing), 7);
        assert_eq!(t.tag(MessageKind::OpenConnectionReply), 26);
        assert_eq!(t.tag(MessageKind::ConnectionRequestAccepted), 33);
        assert_eq!(t.tag(MessageKind::UnconnectedPong), 40);
        assert_eq!(t.user_start(), 80);
    }

    #[test]
    fn test_versions_disagree_on_purpose() {
        // The same symbolic name maps to different bytes per version; the
        // tables are intentionally wire-incompatible.
        let a = TagTable::new(ProtocolVersion::V8910).unwrap();
        let b = TagTable::new(ProtocolVersion::V8935).unwrap();
        assert_ne!(
            a.tag(MessageKind::ConnectionRequest),
            b.tag(MessageKind::ConnectionRequest)
        );
    }

    #[test]
    fn test_roundtrip_lookup() {
        let t = TagTable::new(ProtocolVersion::V8935).unwrap();
        for &kind in ALL_KINDS.iter() {
            assert_eq!(t.kind(t.tag(kind)), Some(kind));
        }
    }

    #[test]
    fn test_out_of_range_tag() {
        let t = TagTable::new(ProtocolVersion::V8910).unwrap();
        // 50 is unassigned in 8910 and below the user boundary.
        assert_eq!(t.kind(50), None);
        assert!(!t.is_user(50));
        // 92 and above belong to the application.
        assert!(t.is_user(92));
        assert!(t.is_user(200));
    }

    #[test]
    fn test_version_id_mapping() {
        assert_eq!(ProtocolVersion::from_id(8910), Some(ProtocolVersion::V8910));
        assert_eq!(ProtocolVersion::from_id(4047), Some(ProtocolVersion::V4045));
        assert_eq!(ProtocolVersion::from_id(1234), None);
    }
}
