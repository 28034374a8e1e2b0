//! New incoming connection message.

use std::net::SocketAddr;

use super::addr::{addr_size, put_addr, read_addr, sizeof_addr, SIZEOF_ADDR6};
use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// Final handshake message: the client's confirmation after its connection
/// request was accepted. Receipt completes the handshake on the server.
#[derive(Debug, Clone)]
pub struct NewIncomingConnection {
    pub server_address: SocketAddr,
    pub request_time: i64,
    pub accept_time: i64,
}

impl Default for NewIncomingConnection {
    fn default() -> Self {
        Self {
            server_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            request_time: 0,
            accept_time: 0,
        }
    }
}

impl NewIncomingConnection {
    /// Creates a new incoming connection confirmation.
    pub fn new(server_address: SocketAddr, request_time: i64, accept_time: i64) -> Self {
        Self {
            server_address,
            request_time,
            accept_time,
        }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < addr_size(data) {
            return Err(Error::UnexpectedEof);
        }
        let (server_address, offset) = read_addr(data);

        if data.len() < offset + 16 {
            return Err(Error::UnexpectedEof);
        }
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
            server_address,
            request_time,
            accept_time,
        })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + sizeof_addr(&self.server_address) + 16);
        buf.push(table.tag(MessageKind::NewIncomingConnection));

        let mut addr_buf = [0u8; SIZEOF_ADDR6];
        let addr_len = put_addr(&mut addr_buf, self.server_address);
        buf.extend_from_slice(&addr_buf[..addr_len]);

        buf.extend_from_slice(&self.request_time.to_be_bytes());
        buf.extend_from_slice(&self.accept_time.to_be_bytes());
        buf
    }
}
