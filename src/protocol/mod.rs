//! # Protocol Layer
//!
//! Message routing on top of decoded frames: the [`Dispatcher`] maps message
//! type ids to handlers and contains every failure that happens past framing.

pub mod dispatcher;

pub use dispatcher::{DispatchOutcome, Dispatcher};
