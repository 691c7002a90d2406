//! Minimal HTTP/1.x support: request-head parsing and response assembly.
//!
//! Shoreline is not a web framework; it parses just enough of a request to
//! route it (static file, WebSocket upgrade, or an error page) and emits
//! `Connection: close` responses. Bodies on incoming requests are ignored —
//! only `GET` is served.

pub mod request;
pub mod response;

pub use request::{RequestError, RequestHead};
