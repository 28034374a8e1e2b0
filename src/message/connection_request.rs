//! Connection request message.

use crate::error::{Error, Result};
use crate::tags::{MessageKind, TagTable};

/// Second handshake phase: sent reliably once the open-connection exchange
/// settled. Carries the client GUID, a request timestamp and the connection
/// password, which the server validates before accepting.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRequest {
    pub client_id: i64,
    pub request_time: i64,
    pub password: Vec<u8>,
}

impl ConnectionRequest {
    /// Creates a new connection request.
    pub fn new(client_id: i64, request_time: i64, password: Vec<u8>) -> Self {
        Self {
            client_id,
            request_time,
            password,
        }
    }

    /// Deserializes the message body.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::UnexpectedEof);
        }
        let client_id = i64::from_be_bytes([
            data[0], data[1], data[2], data[3],
            data[4], data[5], data[6], data[7],
        ]);
        let request_time = i64::from_be_bytes([
            data[8], data[9], data[10], data[11],
            data[12], data[13], data[14], data[15],
        ]);
        let password = data[16..].to_vec();

        Ok(Self {
            client_id,
            request_time,
            password,
        })
    }

    /// Serializes the message.
    pub fn write(&self, table: &TagTable) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17 + self.password.len());
        buf.push(table.tag(MessageKind::ConnectionRequest));
        buf.extend_from_slice(&self.client_id.to_be_bytes());
        buf.extend_from_slice(&self.request_time.to_be_bytes());
        buf.extend_from_slice(&self.password);
        buf
    }
}
