//! # Connections
//!
//! Live stream connections, the registry workers share, and the observer
//! capability every transport reports through.
//!
//! ## Ownership rules
//! - The [`ConnectionRegistry`] is the only structure mutated by several
//!   workers at once; its lock never spans socket I/O.
//! - A connection's socket reads and decode state belong to exactly one
//!   worker at a time: the holder of its busy claim (polling pool), its
//!   bucket worker (ordered-queue pool) or its dedicated reader.
//! - Writes are queued and serialized by the connection's own writer task.

pub mod handle;
pub mod observer;
pub mod registry;

pub use handle::{ConnectionHandle, ConnectionId};
pub use observer::{ConnectionObserver, DisconnectReason, Observers};
pub use registry::{ConnectionRegistry, RegistryEntry};
