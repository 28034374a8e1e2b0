//! Protocol messages for connection establishment and maintenance.
//!
//! Every message writes its leading tag byte through the active
//! [`TagTable`](crate::tags::TagTable), so the same symbolic message encodes
//! differently per protocol version. `read` implementations receive the body
//! with the tag byte already stripped.

mod addr;
mod connected_pong;
mod connection_request;
mod connection_request_accepted;
mod internal_ping;
mod new_incoming_connection;
mod open_connection_reply;
mod open_connection_request;
mod static_data;
mod timestamp_sync;
mod unconnected_ping;
mod unconnected_pong;

pub use addr::*;
pub use connected_pong::*;
pub use connection_request::*;
pub use connection_request_accepted::*;
pub use internal_ping::*;
pub use new_incoming_connection::*;
pub use open_connection_reply::*;
pub use open_connection_request::*;
pub use static_data::*;
pub use timestamp_sync::*;
pub use unconnected_ping::*;
pub use unconnected_pong::*;

/// The magic sequence found in every offline (unconnected) message, used to
/// tell protocol traffic apart from stray datagrams on the same port.
pub const OFFLINE_MESSAGE_MAGIC: [u8; 16] = [
    0x00, 0xff, 0xff, 0x00, 0xfe, 0xfe, 0xfe, 0xfe,
    0xfd, 0xfd, 0xfd, 0xfd, 0x12, 0x34, 0x56, 0x78,
];
