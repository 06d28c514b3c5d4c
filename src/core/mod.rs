//! # Core Framing Components
//!
//! Low-level frame handling: the frame type, the streaming codec that
//! rebuilds frames from chunked reads, and the serializer capability.
//!
//! ## Components
//! - **Frame**: immutable header + payload, with minimal or extended layout
//! - **Codec**: per-connection decode state machine, also a Tokio codec
//! - **Serialization**: pluggable object serializer
//!
//! ## Wire Format
//! ```text
//! [totalLength(4)] [messageTypeId(4)] ([typeNameLength(4)] [payloadLength(4)] [typeName(N)]) [payload(M)]
//! ```
//!
//! ## Safety limits
//! - `totalLength` must exceed the header size and stay under the configured
//!   maximum (16MB by default), checked before any body is buffered

pub mod codec;
pub mod frame;
pub mod serialization;

pub use codec::FrameCodec;
pub use frame::{Frame, HeaderLayout};
pub use serialization::{SerializationFormat, Serializer};
