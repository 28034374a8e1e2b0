//! relnet is a reliable transport layer over UDP.
//!
//! Payloads are carried in acknowledged datagrams with retransmission,
//! duplicate rejection and per-channel ordered delivery, so applications get
//! stream-like guarantees with datagram framing. Every message starts with a
//! tag byte resolved through a versioned tag table, and a connection is only
//! established between endpoints speaking the same protocol revision.
//!
//! # Server
//!
//! ```no_run
//! use relnet::Listener;
//!
//! #[tokio::main]
//! async fn main() -> relnet::Result<()> {
//!     let mut listener = Listener::listen("0.0.0.0:19132").await?;
//!     loop {
//!         let conn = listener.accept().await?;
//!         tokio::spawn(async move {
//!             let mut buf = [0u8; 1500];
//!             while let Ok(n) = conn.read(&mut buf).await {
//!                 conn.write(&buf[..n]).await.ok();
//!             }
//!         });
//!     }
//! }
//! ```
//!
//! # Client
//!
//! ```no_run
//! use relnet::Dialer;
//!
//! #[tokio::main]
//! async fn main() -> relnet::Result<()> {
//!     let conn = Dialer::default().dial("127.0.0.1:19132").await?;
//!
//!     // User payloads start with a tag byte at or above the user boundary.
//!     let mut msg = vec![conn.table().user_start()];
//!     msg.extend_from_slice(b"Hello, world!");
//!     conn.write(&msg).await?;
//!
//!     conn.close().await?;
//!     Ok(())
//! }
//! ```

mod acknowledge;
mod binary;
mod conn;
mod dial;
mod dispatch;
mod error;
mod event;
mod handler;
mod listener;
pub mod message;
mod order_queue;
mod packet;
mod recv_window;
mod resend_map;
mod state;
mod tags;

pub use conn::{Conn, ConnSettings};
pub use dial::Dialer;
pub use error::{Error, Result};
pub use event::{DisconnectReason, Event};
pub use listener::{ListenConfig, Listener};
pub use packet::Reliability;
pub use state::ConnectionState;
pub use tags::{MessageKind, ProtocolVersion, TagTable};

/// Smallest MTU a connection may negotiate.
pub const MIN_MTU_SIZE: u16 = 400;

/// Largest MTU a connection may negotiate.
pub const MAX_MTU_SIZE: u16 = 1492;

/// Maximum width of the receive and order windows before a peer is
/// considered misbehaving.
pub const MAX_WINDOW_SIZE: u32 = 2048;

/// Number of independent ordering channels per connection.
pub const MAX_ORDER_CHANNELS: usize = 32;

/// Milliseconds since the Unix epoch, used in ping and handshake timestamps.
pub(crate) fn timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
