//! Shoreline: an embeddable HTTP/1.1 and WebSocket server on one I/O thread.
//!
//! Shoreline is meant to be linked into a host application that wants to expose
//! a small web surface (static files plus live WebSocket endpoints) without
//! bringing in a full web framework. All I/O runs on a single dedicated thread
//! that multiplexes every client connection through level-triggered epoll.
//!
//! # Core Guarantees
//!
//! - **Single-owner state**: the connection table, readiness set, and handler
//!   registry are owned by the I/O thread; cross-thread access is a bug that
//!   the thread guard detects loudly.
//! - **Two cross-thread entry points**: [`ServerHandle::schedule`] and
//!   [`ServerHandle::terminate`] are the only operations callable from other
//!   threads; everything else funnels through the task queue.
//! - **Exactly-once teardown**: every connection is deregistered, erased, and
//!   closed exactly once, on every exit path including shutdown.
//!
//! # Module Structure
//!
//! - [`server`]: the event loop, connection table, task queue, and wakeup pipe
//! - [`poll`]: level-triggered readiness set over epoll
//! - [`conn`]: the per-peer connection adapter driven by the loop
//! - [`http`]: request-head parsing and the static-file responder
//! - [`ws`]: RFC 6455 handshake, frame codec, and the handler trait
//! - [`sso`]: single-sign-on options and extracted credentials
//! - [`error`]: setup error types
//!
//! # Example
//!
//! ```ignore
//! use shoreline::{Message, Server, WebSocketHandler};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl WebSocketHandler for Echo {
//!     fn on_message(&self, conn: &mut shoreline::Connection, msg: Message) {
//!         if let Message::Text(text) = msg {
//!             conn.send_text(&text);
//!         }
//!     }
//! }
//!
//! let mut server = Server::new();
//! server.add_websocket_handler("/echo", Arc::new(Echo), false);
//! let handle = server.handle();
//! std::thread::spawn(move || server.serve("web", 9090));
//! // ... later, from any thread:
//! handle.terminate();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

pub mod conn;
pub mod error;
pub mod http;
pub mod poll;
pub mod server;
pub mod sso;
pub mod ws;

pub use conn::Connection;
pub use error::ServerError;
pub use server::{Server, ServerHandle, Task};
pub use sso::{Credentials, SsoOptions};
pub use ws::{Message, WebSocketHandler};
