//! # Transports
//!
//! Socket plumbing around the codec and worker pools.
//!
//! - [`TcpServer`]: accept loop feeding the configured worker strategy
//! - [`TcpClient`]: one outbound stream with a dedicated reader
//! - [`DatagramEndpoint`]: framed UDP with a hard datagram size cap

pub mod tcp;
pub mod udp;

pub use tcp::{TcpClient, TcpServer};
pub use udp::DatagramEndpoint;
