//! Error types shared by the poller, worker and load generator roles.

use crate::protocol::ProtocolError;
use std::fmt;
use std::io;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Harness error.
///
/// None of these are retried: the harness measures steady-state throughput,
/// so any unexpected condition ends the run.
#[derive(Debug)]
pub enum Error {
    /// Bind, listen, register, connect or thread spawn failed.
    Setup(&'static str, io::Error),
    /// A syscall failed after setup.
    Io(&'static str, io::Error),
    /// Peer sent a token of the wrong length or content.
    Protocol(ProtocolError),
    /// Server side closed a client connection mid-run.
    PeerClosed,
    /// A role thread panicked.
    Thread(String),
}

impl Error {
    pub(crate) fn setup(context: &'static str, source: io::Error) -> Self {
        Error::Setup(context, source)
    }

    pub(crate) fn io(context: &'static str, source: io::Error) -> Self {
        Error::Io(context, source)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Setup(context, e) => write!(f, "{context} failed during setup: {e}"),
            Error::Io(context, e) => write!(f, "{context} failed: {e}"),
            Error::Protocol(e) => write!(f, "protocol violation: {e}"),
            Error::PeerClosed => write!(f, "peer closed connection before the run completed"),
            Error::Thread(name) => write!(f, "thread '{name}' panicked"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Setup(_, e) | Error::Io(_, e) => Some(e),
            Error::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}
