//! Routing of decoded messages by their leading tag byte.
//!
//! Every payload released by the reliability layer passes through here. The
//! tag byte is resolved against the connection's active tag table: transport
//! messages are consumed internally, tags at or above the user boundary are
//! surfaced to the application, and anything unknown below the boundary is
//! dropped without an error.

use crate::conn::Conn;
use crate::error::Result;
use crate::event::DisconnectReason;
use crate::message as msg;
use crate::tags::MessageKind;
use crate::timestamp;

/// What the dispatcher decided about a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// The message was a transport message and has been handled.
    Consumed,
    /// The tag is in the user range; the payload belongs to the application.
    User,
}

/// Dispatches one complete payload. `content` starts with the tag byte.
pub(crate) fn dispatch(conn: &Conn, content: &[u8]) -> Result<Disposition> {
    let tag = content[0];
    let body = &content[1..];
    let table = conn.table();

    let kind = match table.kind(tag) {
        Some(kind) => kind,
        None => {
            if table.is_user(tag) {
                return Ok(Disposition::User);
            }
            // Unassigned tag below the user boundary, dropped silently.
            tracing::debug!(peer = %conn.remote_addr(), tag, "dropping message with unassigned tag");
            return Ok(Disposition::Consumed);
        }
    };

    match kind {
        MessageKind::InternalPing => {
            let ping = msg::InternalPing::read(body)?;
            let pong = msg::ConnectedPong::new(ping.ping_time, timestamp());
            conn.send_message(&pong.write(table))?;
        }
        MessageKind::ConnectedPong => {
            let pong = msg::ConnectedPong::read(body)?;
            conn.observe_pong(pong.ping_time)?;
            conn.observe_remote_time(pong.pong_time);
        }
        MessageKind::DetectLostConnections => {
            // The peer is probing whether we are still alive.
            let ping = msg::InternalPing::new(timestamp());
            conn.send_message(&ping.write(table))?;
        }
        MessageKind::Timestamp => {
            let sync = msg::TimestampSync::read(body)?;
            conn.observe_remote_time(sync.remote_time);
        }
        MessageKind::RequestStaticData => {
            let reply = msg::ReceivedStaticData::new(conn.static_data());
            conn.send_message(&reply.write(table))?;
        }
        MessageKind::ReceivedStaticData => {
            let data = msg::ReceivedStaticData::read(body);
            conn.store_remote_static_data(&data.data);
        }
        MessageKind::DisconnectionNotification => {
            conn.close_with(DisconnectReason::Notified);
        }
        other => {
            // Handshake messages and role asymmetry live in the handler.
            let handler = conn.handler().clone();
            if !handler.handle(conn, other, body)? {
                tracing::debug!(
                    peer = %conn.remote_addr(),
                    kind = ?other,
                    "dropping unhandled transport message"
                );
            }
        }
    }

    Ok(Disposition::Consumed)
}
