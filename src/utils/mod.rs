//! # Utility Modules
//!
//! Supporting utilities shared by every layer of the crate.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe traffic and failure counters
//! - **Panic**: Formatting of panic payloads caught around handlers
//! - **Timeout**: Timeout defaults, deadline wrappers and bounded worker joins

pub mod logging;
pub mod metrics;
pub mod panic;
pub mod timeout;

pub use metrics::{Metrics, MetricsSnapshot};
