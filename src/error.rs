//! Driver error taxonomy.
//!
//! Errors are cloneable on purpose: the first failure in a session's reader
//! task is stored on the session and handed back from every subsequent step
//! until the session is closed.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// All failures surfaced by the driver.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The server violated the RFB protocol, or sent something outside the
    /// supported subset (unknown encoding, oversized rectangle, bad
    /// handshake).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TCP read/write failure, including short reads.
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),

    /// The server rejected VNC authentication.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The session was configured with invalid options, or the negotiated
    /// pixel format is outside what the decoders support.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A rectangle payload could not be decoded: zlib failure, JPEG failure,
    /// palette index out of range, or leftover bytes after a full parse.
    #[error("decode error: {0}")]
    Decode(String),

    /// Operation on a session that has already been closed.
    #[error("session is closed")]
    Closed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    /// Whether a connect-phase failure is worth retrying. I/O failures
    /// (refused connection, EOF mid-handshake) are transient; an
    /// authentication or protocol mismatch will not fix itself.
    pub(crate) fn is_soft(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}
