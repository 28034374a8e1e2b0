//! Static data exchange messages.

use crate::tags::{MessageKind, TagTable};

/// A request for the peer's static data. The body is empty; the tag byte is
/// the whole message.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStaticData;

impl RequestStaticData {
    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        vec![table.tag(MessageKind::RequestStaticData)]
    }
}

/// The peer's static data blob, sent automatically after connecting and in
/// answer to [`RequestStaticData`]. The transport treats the content as
/// opaque bytes.
#[derive(Debug, Clone, Default)]
pub struct ReceivedStaticData {
    pub data: Vec<u8>,
}

impl ReceivedStaticData {
    /// Creates a new static data message.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Deserializes the message body. The whole body is the blob.
    pub fn read(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.data.len());
        buf.push(table.tag(MessageKind::ReceivedStaticData));
        buf.extend_from_slice(&self.data);
        buf
    }
}
