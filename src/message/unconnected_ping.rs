//! Unconnected ping message.

use super::OFFLINE_MESSAGE_MAGIC;
use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// An offline ping used to discover and enumerate servers without opening a
/// connection.
#[derive(Debug, Clone, Default)]
pub struct UnconnectedPing {
    pub ping_time: i64,
    pub client_id: i64,
}

impl UnconnectedPing {
    /// Creates a new unconnected ping.
    pub fn new(ping_time: i64, client_id: i64) -> Self {
        Self {
            ping_time,
            client_id,
        }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::UnexpectedEof);
        }
        let ping_time = i64::from_be_bytes([
            data[0], data[1], data[2], data[3],
            data[4], data[5], data[6], data[7],
        ]);
        // Magic: 16 bytes (8..24)
        let client_id = i64::from_be_bytes([
            data[24], data[25], data[26], data[27],
            data[28], data[29], data[30], data[31],
        ]);
        Ok(Self {
            ping_time,
            client_id,
        })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(33);
        buf.push(table.tag(MessageKind::UnconnectedPing));
        buf.extend_from_slice(&self.ping_time.to_be_bytes());
        buf.extend_from_slice(&OFFLINE_MESSAGE_MAGIC);
        buf.extend_from_slice(&self.client_id.to_be_bytes());
        buf
    }
}
