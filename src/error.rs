//! Setup error types.
//!
//! Only server startup can fail with a returned error; once the event loop is
//! running, per-connection problems are logged and handled in-loop, and
//! shutdown is the only externally observable terminal state.

use std::io;
use std::net::SocketAddr;

/// Errors that can prevent [`Server::serve`](crate::Server::serve) from
/// entering its event loop.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listening socket could not be created or configured.
    #[error("unable to create listen socket: {0}")]
    Listen(#[source] io::Error),

    /// Binding or listening on the requested address failed.
    #[error("unable to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The epoll readiness set could not be created.
    #[error("unable to create readiness set: {0}")]
    Readiness(#[source] io::Error),

    /// The wakeup pipe could not be created.
    #[error("unable to create wakeup pipe: {0}")]
    Wakeup(#[source] io::Error),

    /// `serve` was called while another `serve` is still running.
    #[error("server is already running")]
    AlreadyRunning,
}
