//! Error types for the broadcast server.
//!
//! Only listener setup and poll failures are fatal. Everything that goes
//! wrong on a single connection is contained to that connection by the
//! event loop and never surfaces as a `ServerError`.

use std::io;
use thiserror::Error;

/// Errors raised by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be bound.
    #[error("bind() failed for {target}: {source}")]
    Bind {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The bound socket could not be put into listening mode.
    #[error("listen() failed for {target}: {source}")]
    Listen {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The readiness wait itself failed.
    #[error("poll() failed: {0}")]
    Poll(#[source] io::Error),

    /// The connection table is full; the new connection must be rejected.
    #[error("connection limit of {0} reached")]
    CapacityExceeded(usize),

    /// Socket registration or other per-connection I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// More bytes were fed to a line buffer than it has room for.
    #[error("line buffer overrun: {incoming} bytes offered, {spare} bytes free")]
    BufferOverrun { incoming: usize, spare: usize },
}

impl ServerError {
    /// Process exit status for fatal errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            ServerError::Bind { .. } => 3,
            ServerError::Listen { .. } => 4,
            ServerError::Poll(_) => 5,
            ServerError::CapacityExceeded(_)
            | ServerError::Io(_)
            | ServerError::BufferOverrun { .. } => 1,
        }
    }
}
