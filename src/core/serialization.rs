//! # Serialization Formats
//!
//! The object serializer is an injected capability: the dispatcher and the
//! bridge only ever call [`Serializer::serialize`] and
//! [`Serializer::deserialize`], and never look at the bytes themselves.
//!
//! [`SerializationFormat`] is the stock implementation, offering bincode
//! (compact, default) and JSON (human-readable, handy for interop and
//! debugging). Both ends of a connection must agree on the format.
//!
//! ## Usage
//! ```rust
//! use frame_bridge::core::serialization::{SerializationFormat, Serializer};
//!
//! let format = SerializationFormat::Json;
//! let bytes = format.serialize(&vec![1u32, 2, 3]).unwrap();
//! let back: Vec<u32> = format.deserialize(&bytes).unwrap();
//! assert_eq!(back, vec![1, 2, 3]);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ProtocolError, Result};

/// Object serialization capability.
///
/// Failures are reported as [`ProtocolError::SerializeError`] /
/// [`ProtocolError::DeserializeError`]; callers treat them as recoverable.
pub trait Serializer: Send + Sync + 'static {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializationFormat {
    /// Binary compact format (default, fastest)
    #[default]
    Bincode,
    /// Human-readable JSON format (debugging, interop)
    Json,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::Json => "JSON",
        }
    }
}

impl Serializer for SerializationFormat {
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => {
                bincode::serialize(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
            }
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(bytes)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
            SerializationFormat::Json => serde_json::from_slice(bytes)
                .map_err(|e| ProtocolError::DeserializeError(e.to_string())),
        }
    }
}
