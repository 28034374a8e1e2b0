//! Open connection request message.

use super::OFFLINE_MESSAGE_MAGIC;
use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// Offline request opening the first handshake phase. Carries the sender's
/// protocol revision so a mismatched peer can be rejected before any session
/// state exists.
#[derive(Debug, Clone, Default)]
pub struct OpenConnectionRequest {
    pub version_id: u16,
    pub mtu: u16,
}

impl OpenConnectionRequest {
    /// Creates a new open connection request.
    pub fn new(version_id: u16, mtu: u16) -> Self {
        Self { version_id, mtu }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 20 {
            return Err(Error::UnexpectedEof);
        }
        // Magic: 16 bytes (skip)
        let version_id = u16::from_be_bytes([data[16], data[17]]);
        let mtu = u16::from_be_bytes([data[18], data[19]]);

        Ok(Self { version_id, mtu })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(21);
        buf.push(table.tag(MessageKind::OpenConnectionRequest));
        buf.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
        buf.extend_from_slice(&self.version_id.to_be_bytes());
        buf.extend_from_slice(&self.mtu.to_be_bytes());
        buf
    }
}
