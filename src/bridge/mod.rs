//! # Bridge
//!
//! Request/response RPC between bridge nodes, over UDP datagrams or TCP
//! streams, using the same frame format as everything else.
//!
//! ## Components
//! - **Identity**: listen and public endpoints, allowed peers
//! - **Messages**: `Request`, `Response` and `Notify` envelopes
//! - **Pending table**: correlation ids awaiting a response or deadline
//! - **Node**: lifecycle, handlers, listeners, request issue and resolution
//!
//! ## Usage
//! ```rust,no_run
//! use frame_bridge::bridge::Bridge;
//! use frame_bridge::config::NetworkConfig;
//! use frame_bridge::utils::Metrics;
//! use std::sync::Arc;
//!
//! # async fn run() -> frame_bridge::error::Result<()> {
//! let node = Bridge::new(&NetworkConfig::default(), Arc::new(Metrics::new()))?;
//! node.add_handler("upper", |text: String, _origin| Ok(text.to_uppercase()))?;
//! node.start().await?;
//!
//! let peer = "127.0.0.1:9200".parse().unwrap();
//! node.allow_peer(peer);
//! let reply: Result<String, _> = node.call(peer, "upper", "hello", None).await;
//! # Ok(())
//! # }
//! ```

pub mod identity;
pub mod message;
pub mod node;
pub mod pending;
mod transport;

pub use identity::BridgeNodeIdentity;
pub use message::{BridgeEnvelope, BridgeMessage};
pub use node::{Bridge, BridgeState};
pub use pending::{PendingRequest, PendingTable};
