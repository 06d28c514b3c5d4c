//! # Error Types
//!
//! Error handling for framing, dispatch, connection workers and the bridge.
//!
//! Every fallible operation in the crate returns [`Result`], built on a single
//! [`ProtocolError`] enum. The variants follow how far a failure is allowed to
//! travel:
//!
//! ## Error Categories
//! - **Connection-fatal**: framing violations and socket failures. The affected
//!   connection is torn down and a disconnect event is raised; nothing else is
//!   touched. See [`ProtocolError::is_connection_fatal`].
//! - **Recovered locally**: serialization failures, handler failures and
//!   unhandled message types. The frame is dropped, the connection stays open.
//! - **Configuration**: duplicate handler ids, invalid settings and lifecycle
//!   misuse. These fail fast at startup.
//! - **Bridge**: no-handler answers and request timeouts, delivered to the
//!   caller's completion as a [`BridgeError`].
//!
//! ## Example Usage
//! ```rust
//! use frame_bridge::error::{ProtocolError, Result};
//!
//! fn check_length(total: usize, max: usize) -> Result<()> {
//!     if total > max {
//!         return Err(ProtocolError::OversizedFrame(total));
//!     }
//!     Ok(())
//! }
//!
//! let err = check_length(10, 4).unwrap_err();
//! assert!(err.is_connection_fatal());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Dispatcher lock errors
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";

    /// Framing errors
    pub const ERR_LENGTH_TOO_SMALL: &str = "Declared frame length does not exceed header size";
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative length field in frame header";
    pub const ERR_LENGTH_MISMATCH: &str = "Frame length fields are inconsistent";
    pub const ERR_EMPTY_FRAME: &str = "Frame must carry at least one byte of body";
    pub const ERR_TYPE_NAME_UTF8: &str = "Embedded type name is not valid UTF-8";
    pub const ERR_TRAILING_DATAGRAM_BYTES: &str = "Datagram ends with a partial frame";
    pub const ERR_DECODER_FAILED: &str = "Decoder already failed for this connection";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_LIMIT: &str = "Connection limit reached";

    /// Lifecycle errors
    pub const ERR_ALREADY_STARTED: &str = "Component already started";
    pub const ERR_NOT_STARTED: &str = "Component not started";
}

/// ProtocolError is the primary error type for all operations in the crate.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Datagram too large: {size} bytes (max {max})")]
    DatagramTooLarge { size: usize, max: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("No handler registered for {0}")]
    NoHandler(String),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Peer not allowed: {0}")]
    PeerNotAllowed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Whether this error must tear down the connection it occurred on.
    ///
    /// Only framing violations and socket-level failures escalate past the
    /// connection boundary; everything else is recovered where it happened.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Framing(_)
                | ProtocolError::OversizedFrame(_)
                | ProtocolError::Io(_)
                | ProtocolError::Transport(_)
                | ProtocolError::ConnectionClosed
        )
    }
}

/// Failure delivered to a bridge request's completion.
///
/// This is also the error half of a `Response` on the wire, so a remote
/// `NoHandler` arrives at the caller exactly as it was produced.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("No handler registered for '{0}'")]
    NoHandler(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::NoHandler(id) => BridgeError::NoHandler(id),
            ProtocolError::Handler(msg) => BridgeError::HandlerFailed(msg),
            ProtocolError::RequestTimeout | ProtocolError::Timeout => BridgeError::Timeout,
            ProtocolError::Serialization(e) => BridgeError::Serialization(e.to_string()),
            ProtocolError::SerializeError(msg) | ProtocolError::DeserializeError(msg) => {
                BridgeError::Serialization(msg)
            }
            other => BridgeError::Transport(other.to_string()),
        }
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_fatal_classification() {
        assert!(ProtocolError::Framing("bad".into()).is_connection_fatal());
        assert!(ProtocolError::OversizedFrame(1 << 30).is_connection_fatal());
        assert!(ProtocolError::ConnectionClosed.is_connection_fatal());
        assert!(ProtocolError::Io(io::Error::other("reset")).is_connection_fatal());

        assert!(!ProtocolError::DeserializeError("junk".into()).is_connection_fatal());
        assert!(!ProtocolError::Handler("boom".into()).is_connection_fatal());
        assert!(!ProtocolError::NoHandler("7".into()).is_connection_fatal());
    }

    #[test]
    fn test_bridge_error_mapping() {
        assert_eq!(
            BridgeError::from(ProtocolError::NoHandler("echo".into())),
            BridgeError::NoHandler("echo".into())
        );
        assert_eq!(
            BridgeError::from(ProtocolError::RequestTimeout),
            BridgeError::Timeout
        );
        assert!(matches!(
            BridgeError::from(ProtocolError::ConnectionClosed),
            BridgeError::Transport(_)
        ));
    }
}
