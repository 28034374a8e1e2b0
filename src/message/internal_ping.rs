//! Internal ping message.

use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// A ping sent periodically over an established connection. Keeps the
/// activity window open and samples the round-trip time.
#[derive(Debug, Clone, Default)]
pub struct InternalPing {
    pub ping_time: i64,
}

impl InternalPing {
    /// Creates a new ping with the given timestamp.
    pub fn new(ping_time: i64) -> Self {
        Self { ping_time }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::UnexpectedEof);
        }
        let ping_time = i64::from_be_bytes([
            data[0], data[1], data[2], data[3],
            data[4], data[5], data[6], data[7],
        ]);
        Ok(Self { ping_time })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(table.tag(MessageKind::InternalPing));
        buf.extend_from_slice(&self.ping_time.to_be_bytes());
        buf
    }
}
