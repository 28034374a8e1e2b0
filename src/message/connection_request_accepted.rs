//! Connection request accepted message.

use std::net::SocketAddr;

use super::addr::{addr_size, put_addr, read_addr, sizeof_addr, SIZEOF_ADDR6};
use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// Second handshake phase: the server's acceptance of a connection request.
/// Echoes the client's address and request timestamp so the client can
/// measure the handshake round trip.
#[derive(Debug, Clone)]
pub struct ConnectionRequestAccepted {
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub request_time: i64,
    pub accept_time: i64,
}

impl Default for ConnectionRequestAccepted {
    fn default() -> Self {
        Self {
            client_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            system_index: 0,
            request_time: 0,
            accept_time: 0,
        }
    }
}

impl ConnectionRequestAccepted {
    /// Creates a new acceptance message.
    pub fn new(
        client_address: SocketAddr,
        system_index: u16,
        request_time: i64,
        accept_time: i64,
    ) -> Self {
        Self {
            client_address,
            system_index,
            request_time,
            accept_time,
        }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < addr_size(data) {
            return Err(Error::UnexpectedEof);
        }
        let (client_address, mut offset) = read_addr(data);

        if data.len() < offset + 2 + 16 {
            return Err(Error::UnexpectedEof);
        }
        let system_index = u16::from_be_bytes([data[offset], data[offset + 1]]);
        offset += 2;

        let request_time = i64::from_be_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);
        let accept_time = i64::from_be_bytes([
            data[offset + 8],
            data[offset + 9],
            data[offset + 10],
            data[offset + 11],
            data[offset + 12],
            data[offset + 13],
            data[offset + 14],
            data[offset + 15],
        ]);

        Ok(Self {
            client_address,
            system_index,
            request_time,
            accept_time,
        })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + sizeof_addr(&self.client_address) + 2 + 16);
        buf.push(table.tag(MessageKind::ConnectionRequestAccepted));

        let mut addr_buf = [0u8; SIZEOF_ADDR6];
        let addr_len = put_addr(&mut addr_buf, self.client_address);
        buf.extend_from_slice(&addr_buf[..addr_len]);

        buf.extend_from_slice(&self.system_index.to_be_bytes());
        buf.extend_from_slice(&self.request_time.to_be_bytes());
        buf.extend_from_slice(&self.accept_time.to_be_bytes());
        buf
    }
}
