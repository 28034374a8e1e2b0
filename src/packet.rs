//! Encapsulated packet framing for connected datagrams.

use bytes::BufMut;

use crate::binary::{load_uint24, write_uint16, write_uint24, write_uint32, Uint24};
use crate::error::{Error, Result};

/// Bit flag set for every valid datagram.
pub const BIT_FLAG_DATAGRAM: u8 = 0x80;

/// Bit flag set for every ACK packet.
pub const BIT_FLAG_ACK: u8 = 0x40;

/// Bit flag set for every NACK packet.
pub const BIT_FLAG_NACK: u8 = 0x20;

/// Split flag in the encapsulation header.
const SPLIT_FLAG: u8 = 0x10;

/// Delivery guarantee requested for a payload.
///
/// The discriminants are the wire values carried in the encapsulation
/// header (bits 5-7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Reliability {
    /// Best effort: may be lost, duplicated or reordered.
    Unreliable = 0,
    /// At-least-once delivery, no ordering across messages.
    Reliable = 2,
    /// At-least-once delivery, released to the application in order per
    /// channel.
    #[default]
    ReliableOrdered = 3,
}

impl Reliability {
    /// Decodes the reliability bits of an encapsulation header.
    pub fn from_header(header: u8) -> Result<Self> {
        match (header & 0xE0) >> 5 {
            0 => Ok(Reliability::Unreliable),
            2 => Ok(Reliability::Reliable),
            3 => Ok(Reliability::ReliableOrdered),
            other => Err(Error::InvalidPacketLength(format!(
                "unsupported reliability {other}"
            ))),
        }
    }

    /// Whether delivery of this payload is acknowledged and retried.
    pub fn is_reliable(self) -> bool {
        matches!(self, Reliability::Reliable | Reliability::ReliableOrdered)
    }

    /// Whether this payload participates in ordered release.
    pub fn is_ordered(self) -> bool {
        matches!(self, Reliability::ReliableOrdered)
    }
}

/// Additional size consumed by datagram and encapsulation headers.
/// Datagram flag + sequence number + checksum + encapsulation header +
/// bit length + message index + order index + order channel.
pub const PACKET_ADDITIONAL_SIZE: u16 = 1 + 3 + 4 + 1 + 2 + 3 + 3 + 1;

/// Additional size for split fragments.
/// Split count + split ID + split index.
pub const SPLIT_ADDITIONAL_SIZE: u16 = 4 + 2 + 4;

/// One encapsulated message inside a datagram.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub reliability: Reliability,
    pub message_index: Uint24,
    pub order_index: Uint24,
    pub order_channel: u8,
    pub content: Vec<u8>,
    pub split: bool,
    pub split_count: u32,
    pub split_index: u32,
    pub split_id: u16,
}

impl Packet {
    /// Creates a new packet with default reliability (ReliableOrdered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the packet to the buffer.
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        let mut header = (self.reliability as u8) << 5;
        if self.split {
            header |= SPLIT_FLAG;
        }

        buf.put_u8(header);
        write_uint16(buf, (self.content.len() as u16) << 3);

        if self.reliability.is_reliable() {
            write_uint24(buf, self.message_index);
        }
        if self.reliability.is_ordered() {
            write_uint24(buf, self.order_index);
            buf.put_u8(self.order_channel);
        }
        if self.split {
            write_uint32(buf, self.split_count);
            write_uint16(buf, self.split_id);
            write_uint32(buf, self.split_index);
        }
        buf.put_slice(&self.content);
    }

    /// Reads a packet from the byte slice and returns the number of bytes
    /// consumed.
    pub fn read(&mut self, b: &[u8]) -> Result<usize> {
        if b.len() < 3 {
            return Err(Error::UnexpectedEof);
        }

        let header = b[0];
        self.split = (header & SPLIT_FLAG) != 0;
        self.reliability = Reliability::from_header(header)?;

        let n = (u16::from_be_bytes([b[1], b[2]]) >> 3) as usize;
        if n == 0 {
            return Err(Error::InvalidPacketLength("cannot be 0".to_string()));
        }

        let mut offset = 3;

        if self.reliability.is_reliable() {
            if b.len() - offset < 3 {
                return Err(Error::UnexpectedEof);
            }
            self.message_index = load_uint24(&b[offset..]);
            offset += 3;
        }

        if self.reliability.is_ordered() {
            if b.len() - offset < 4 {
                return Err(Error::UnexpectedEof);
            }
            self.order_index = load_uint24(&b[offset..]);
            self.order_channel = b[offset + 3];
            offset += 4;
        }

        if self.split {
            if b.len() - offset < 10 {
                return Err(Error::UnexpectedEof);
            }
            self.split_count =
                u32::from_be_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]]);
            self.split_id = u16::from_be_bytes([b[offset + 4], b[offset + 5]]);
            self.split_index = u32::from_be_bytes([
                b[offset + 6],
                b[offset + 7],
                b[offset + 8],
                b[offset + 9],
            ]);
            offset += 10;
        }

        if b.len() - offset < n {
            return Err(Error::UnexpectedEof);
        }

        self.content = b[offset..offset + n].to_vec();
        Ok(offset + n)
    }
}

/// Splits a content buffer into fragments that fit within the MTU budget.
pub fn split(b: &[u8], mtu: u16) -> Vec<&[u8]> {
    let n = b.len();
    let mut max_size = (mtu - PACKET_ADDITIONAL_SIZE) as usize;

    if n > max_size {
        // Split fragments carry additional metadata in every header.
        max_size = (mtu - PACKET_ADDITIONAL_SIZE - SPLIT_ADDITIONAL_SIZE) as usize;
    }

    let fragment_count = n.div_ceil(max_size);
    let mut fragments = Vec::with_capacity(fragment_count);

    let mut remaining = b;
    for _ in 0..fragment_count - 1 {
        fragments.push(&remaining[..max_size]);
        remaining = &remaining[max_size..];
    }
    fragments.push(remaining);

    fragments
}

/// Computes the integrity checksum appended to every datagram.
///
/// Covers the flag byte, the sequence number and the encapsulated payload.
/// A mismatch on receipt means the datagram was modified in transit.
pub fn datagram_checksum(frame: &[u8]) -> u32 {
    crc32fast::hash(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_ordered() {
        let mut pk = Packet::new();
        pk.content = vec![42, 1, 2, 3];
        pk.message_index = Uint24::new(7);
        pk.order_index = Uint24::new(3);
        pk.order_channel = 2;

        let mut buf = Vec::new();
        pk.write(&mut buf);

        let mut read = Packet::new();
        let n = read.read(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(read.reliability, Reliability::ReliableOrdered);
        assert_eq!(read.message_index.value(), 7);
        assert_eq!(read.order_index.value(), 3);
        assert_eq!(read.order_channel, 2);
        assert_eq!(read.content, vec![42, 1, 2, 3]);
    }

    #[test]
    fn test_roundtrip_unreliable() {
        let mut pk = Packet {
            reliability: Reliability::Unreliable,
            content: vec![9, 9],
            ..Default::default()
        };

        let mut buf = Vec::new();
        pk.write(&mut buf);

        let n = pk.read(&buf).unwrap();
        assert_eq!(n, buf.len());
        assert_eq!(pk.reliability, Reliability::Unreliable);
        assert_eq!(pk.content, vec![9, 9]);
    }

    #[test]
    fn test_rejects_unknown_reliability() {
        // Header with reliability bits 0b100 (sequenced, unsupported).
        let buf = [0x80u8, 0x00, 0x08, 0xAA];
        let mut pk = Packet::new();
        assert!(pk.read(&buf).is_err());
    }

    #[test]
    fn test_split_small_packet() {
        let data = vec![0u8; 100];
        let fragments = split(&data, 1492);
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].len(), 100);
    }

    #[test]
    fn test_split_large_packet() {
        let data = vec![0u8; 3000];
        let fragments = split(&data, 1492);
        assert!(fragments.len() > 1);
        let total: usize = fragments.iter().map(|f| f.len()).sum();
        assert_eq!(total, 3000);
    }

    #[test]
    fn test_checksum_detects_modification() {
        let mut frame = vec![0x80, 1, 0, 0, 5, 5, 5];
        let sum = datagram_checksum(&frame);
        frame[4] ^= 0xFF;
        assert_ne!(sum, datagram_checksum(&frame));
    }
}
