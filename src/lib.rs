//! # frame-bridge
//!
//! Toolkit for custom TCP/UDP services built on length-prefixed frames.
//!
//! A raw byte stream is cut back into frames by the streaming
//! [`FrameCodec`](crate::core::FrameCodec), frames are routed to handlers by the
//! [`Dispatcher`](protocol::Dispatcher), and connections are serviced by one
//! of several [worker strategies](pool) that never let two workers touch the
//! same connection at once. The [`bridge`] module layers correlated
//! request/response RPC between nodes on the same framing.
//!
//! ## Modules
//! - [`core`](crate::core): frames, header layouts, codec, serializer capability
//! - [`connection`]: connection handles, registry, lifecycle observers
//! - [`protocol`]: type-id dispatch with failure containment
//! - [`pool`]: polling, ordered-queue and dedicated-reader strategies
//! - [`transport`]: TCP server/client and framed UDP
//! - [`bridge`]: node identity, envelopes, pending requests, bridge node
//! - [`config`], [`error`], [`utils`]: configuration, errors, metrics, logging
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use frame_bridge::config::NetworkConfig;
//! use frame_bridge::connection::Observers;
//! use frame_bridge::protocol::Dispatcher;
//! use frame_bridge::transport::TcpServer;
//! use frame_bridge::utils::Metrics;
//!
//! # async fn run() -> frame_bridge::error::Result<()> {
//! let config = NetworkConfig::default();
//! let metrics = Arc::new(Metrics::new());
//!
//! let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&metrics)));
//! dispatcher.register::<String, _>(1, |text, conn| {
//!     tracing::info!(connection = %conn.id(), %text, "Chat");
//!     Ok(())
//! })?;
//!
//! let server = TcpServer::start(&config, Observers::new().with(dispatcher), metrics).await?;
//! // ...
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use bridge::Bridge;
pub use config::NetworkConfig;
pub use connection::{ConnectionHandle, ConnectionObserver, DisconnectReason, Observers};
pub use crate::core::{Frame, FrameCodec, HeaderLayout, SerializationFormat, Serializer};
pub use error::{BridgeError, ProtocolError, Result};
pub use protocol::Dispatcher;
