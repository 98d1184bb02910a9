//! Fatal proxy errors.
use std::io;

use thiserror::Error;

/// An error that terminates the proxy. Per-connection failures are logged
/// and contained by the reactor; only these reach the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to create the listening socket.
    #[error("listen: {0}")]
    Listen(io::Error),
    /// Failed to create or wait on the readiness multiplexer.
    #[error("poll: {0}")]
    Poll(io::Error),
    /// Failed to install the child-reaping signal disposition.
    #[error("signals: {0}")]
    Signals(io::Error),
}
