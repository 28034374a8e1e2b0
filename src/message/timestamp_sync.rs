//! Timestamp synchronization message.

use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// An embedded remote timestamp used for clock synchronization. Consumed by
/// the transport to maintain a clock offset for the peer; never surfaced to
/// the application.
#[derive(Debug, Clone, Default)]
pub struct TimestampSync {
    pub remote_time: i64,
}

impl TimestampSync {
    /// Creates a new timestamp sync message.
    pub fn new(remote_time: i64) -> Self {
        Self { remote_time }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::UnexpectedEof);
        }
        let remote_time = i64::from_be_bytes([
            data[0], data[1], data[2], data[3],
            data[4], data[5], data[6], data[7],
        ]);
        Ok(Self { remote_time })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(9);
        buf.push(table.tag(MessageKind::Timestamp));
        buf.extend_from_slice(&self.remote_time.to_be_bytes());
        buf
    }
}
