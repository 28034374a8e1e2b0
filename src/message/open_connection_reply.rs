//! Open connection reply message.

use super::OFFLINE_MESSAGE_MAGIC;
use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// Offline reply completing the first handshake phase. Carries the server
/// GUID and the MTU the server settled on.
#[derive(Debug, Clone, Default)]
pub struct OpenConnectionReply {
    pub server_id: i64,
    pub mtu: u16,
}

impl OpenConnectionReply {
    /// Creates a new open connection reply.
    pub fn new(server_id: i64, mtu: u16) -> Self {
        Self { server_id, mtu }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 26 {
            return Err(Error::UnexpectedEof);
        }
        // Magic: 16 bytes (skip)
        let server_id = i64::from_be_bytes([
            data[16], data[17], data[18], data[19],
            data[20], data[21], data[22], data[23],
        ]);
        let mtu = u16::from_be_bytes([data[24], data[25]]);

        Ok(Self { server_id, mtu })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(27);
        buf.push(table.tag(MessageKind::OpenConnectionReply));
        buf.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
        buf.extend_from_slice(&self.server_id.to_be_bytes());
        buf.extend_from_slice(&self.mtu.to_be_bytes());
        buf
    }
}
