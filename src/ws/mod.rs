//! WebSocket support: handshake, framing, and the endpoint handler trait.
//!
//! Handlers are registered per endpoint path before the server starts and are
//! invoked on the I/O thread while the loop is delivering readiness to the
//! owning connection. They must be prompt: a slow callback stalls every other
//! connection on the server.

pub mod frame;
pub mod handshake;

pub use frame::{Frame, Opcode, WsError, MAX_PAYLOAD_BYTES};
pub use handshake::{compute_accept_key, HandshakeError};

use crate::conn::Connection;
use bytes::Bytes;

/// A complete (defragmented) message received from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// UTF-8 text message.
    Text(String),
    /// Binary message.
    Binary(Bytes),
}

/// Callbacks for one WebSocket endpoint.
///
/// All methods run on the I/O thread. The connection handed in is the one the
/// event belongs to; use [`Connection::send_text`] /
/// [`Connection::send_binary`] to answer, and
/// [`Connection::close_websocket`] to start a close handshake.
pub trait WebSocketHandler: Send + Sync {
    /// Called once, after the upgrade response has been queued.
    fn on_open(&self, conn: &mut Connection) {
        let _ = conn;
    }

    /// Called for every complete data message.
    fn on_message(&self, conn: &mut Connection, message: Message);

    /// Called exactly once when the connection goes away, whether by close
    /// handshake, hang-up, error, or server shutdown.
    fn on_close(&self, conn: &mut Connection) {
        let _ = conn;
    }
}
