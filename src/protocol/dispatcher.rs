//! Frame dispatcher and handler registry.
//!
//! Handlers are keyed by message type id and registered once at startup.
//! [`Dispatcher::dispatch`] decodes the payload through the injected
//! [`Serializer`] and invokes the handler synchronously. Every failure past
//! framing is recovered here: bad payloads, missing handlers, handler errors
//! and handler panics are logged, counted and dropped, and the connection
//! stays open.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::connection::{ConnectionHandle, ConnectionObserver};
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::core::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::utils::panic::format_panic;
use crate::utils::Metrics;

type HandlerFn = dyn Fn(&Frame, &Arc<ConnectionHandle>) -> DispatchOutcome + Send + Sync + 'static;

/// What happened to one dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran to completion
    Handled,
    /// No handler is registered for the frame's type id
    Unhandled,
    /// The payload did not deserialize into the handler's message type
    DeserializeFailed,
    /// The handler returned an error or panicked
    HandlerFailed,
}

/// Message dispatcher routing frames by message type id.
pub struct Dispatcher<S: Serializer = SerializationFormat> {
    handlers: RwLock<HashMap<i32, Arc<HandlerFn>>>,
    serializer: Arc<S>,
    metrics: Arc<Metrics>,
}

impl Dispatcher<SerializationFormat> {
    /// Dispatcher using the default (bincode) format.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_serializer(SerializationFormat::default(), metrics)
    }
}

impl<S: Serializer> Dispatcher<S> {
    pub fn with_serializer(serializer: S, metrics: Arc<Metrics>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            serializer: Arc::new(serializer),
            metrics,
        }
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Register a handler receiving payloads decoded as `T`.
    ///
    /// Fails with [`ProtocolError::DuplicateHandler`] if `message_type_id` is
    /// already taken.
    pub fn register<T, F>(&self, message_type_id: i32, handler: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, &Arc<ConnectionHandle>) -> Result<()> + Send + Sync + 'static,
    {
        let serializer = Arc::clone(&self.serializer);
        let metrics = Arc::clone(&self.metrics);

        self.insert(
            message_type_id,
            Arc::new(move |frame: &Frame, conn: &Arc<ConnectionHandle>| {
                let message = match serializer.deserialize::<T>(frame.payload()) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            connection = %conn.id(),
                            message_type_id,
                            error = %e,
                            "Dropping frame with undecodable payload"
                        );
                        metrics.deserialize_failure();
                        return DispatchOutcome::DeserializeFailed;
                    }
                };
                invoke(message_type_id, conn, &metrics, || handler(message, conn))
            }),
        )
    }

    /// Register a handler receiving the raw payload bytes.
    pub fn register_raw<F>(&self, message_type_id: i32, handler: F) -> Result<()>
    where
        F: Fn(Bytes, &Arc<ConnectionHandle>) -> Result<()> + Send + Sync + 'static,
    {
        let metrics = Arc::clone(&self.metrics);

        self.insert(
            message_type_id,
            Arc::new(move |frame: &Frame, conn: &Arc<ConnectionHandle>| {
                let payload = frame.payload().clone();
                invoke(message_type_id, conn, &metrics, || handler(payload, conn))
            }),
        )
    }

    fn insert(&self, message_type_id: i32, handler: Arc<HandlerFn>) -> Result<()> {
        let mut handlers = self.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;

        if handlers.contains_key(&message_type_id) {
            return Err(ProtocolError::DuplicateHandler(message_type_id.to_string()));
        }
        handlers.insert(message_type_id, handler);
        debug!(message_type_id, "Handler registered");
        Ok(())
    }

    pub fn is_registered(&self, message_type_id: i32) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&message_type_id)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Route one frame to its handler. Never fails the connection.
    pub fn dispatch(&self, frame: &Frame, conn: &Arc<ConnectionHandle>) -> DispatchOutcome {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&frame.message_type_id())
            .cloned();

        match handler {
            Some(handler) => handler(frame, conn),
            None => {
                debug!(
                    connection = %conn.id(),
                    message_type_id = frame.message_type_id(),
                    "No handler for frame; dropping"
                );
                self.metrics.frame_unhandled();
                DispatchOutcome::Unhandled
            }
        }
    }
}

fn invoke<F>(
    message_type_id: i32,
    conn: &Arc<ConnectionHandle>,
    metrics: &Metrics,
    call: F,
) -> DispatchOutcome
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => {
            metrics.frame_dispatched();
            DispatchOutcome::Handled
        }
        Ok(Err(e)) => {
            warn!(connection = %conn.id(), message_type_id, error = %e, "Handler failed");
            metrics.handler_failure();
            DispatchOutcome::HandlerFailed
        }
        Err(panic) => {
            error!(
                connection = %conn.id(),
                message_type_id,
                panic = %format_panic(panic),
                "Handler panicked"
            );
            metrics.handler_failure();
            DispatchOutcome::HandlerFailed
        }
    }
}

impl<S: Serializer> ConnectionObserver for Dispatcher<S> {
    fn on_frame(&self, conn: &Arc<ConnectionHandle>, frame: Frame) {
        self.dispatch(&frame, conn);
    }
}

impl<S: Serializer> std::fmt::Debug for Dispatcher<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::loopback_handle;
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Chat {
        text: String,
    }

    fn chat_frame(id: i32, text: &str) -> Frame {
        let payload = SerializationFormat::Bincode
            .serialize(&Chat { text: text.into() })
            .unwrap();
        Frame::new(id, payload)
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let dispatcher = Dispatcher::new(Arc::new(Metrics::new()));
        dispatcher.register::<Chat, _>(1, |_, _| Ok(())).unwrap();

        let err = dispatcher.register_raw(1, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateHandler(id) if id == "1"));
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_typed_dispatch() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher
            .register::<Chat, _>(1, move |msg, _| {
                sink.lock().unwrap().push(msg.text);
                Ok(())
            })
            .unwrap();

        let (conn, _peer) = loopback_handle(1).await;
        assert_eq!(
            dispatcher.dispatch(&chat_frame(1, "hello"), &conn),
            DispatchOutcome::Handled
        );
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
        assert_eq!(metrics.snapshot().frames_dispatched, 1);
    }

    #[tokio::test]
    async fn test_unhandled_and_undecodable_frames_are_dropped() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        dispatcher.register::<Chat, _>(1, |_, _| Ok(())).unwrap();
        let (conn, _peer) = loopback_handle(2).await;

        assert_eq!(
            dispatcher.dispatch(&chat_frame(9, "nobody"), &conn),
            DispatchOutcome::Unhandled
        );
        assert_eq!(
            dispatcher.dispatch(&Frame::new(1, &b"\xff"[..]), &conn),
            DispatchOutcome::DeserializeFailed
        );
        assert!(conn.is_alive());

        let snap = metrics.snapshot();
        assert_eq!(snap.frames_unhandled, 1);
        assert_eq!(snap.deserialize_failures, 1);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_are_contained() {
        let metrics = Arc::new(Metrics::new());
        let dispatcher = Dispatcher::new(Arc::clone(&metrics));
        dispatcher
            .register_raw(1, |_, _| Err(ProtocolError::Handler("nope".into())))
            .unwrap();
        dispatcher
            .register_raw(2, |_, _| panic!("handler blew up"))
            .unwrap();
        let (conn, _peer) = loopback_handle(3).await;

        assert_eq!(
            dispatcher.dispatch(&Frame::new(1, &b"a"[..]), &conn),
            DispatchOutcome::HandlerFailed
        );
        assert_eq!(
            dispatcher.dispatch(&Frame::new(2, &b"b"[..]), &conn),
            DispatchOutcome::HandlerFailed
        );
        assert!(conn.is_alive());
        assert_eq!(metrics.snapshot().handler_failures, 2);
    }

    #[tokio::test]
    async fn test_handler_can_reply_on_connection() {
        let dispatcher = Dispatcher::with_serializer(SerializationFormat::Json, Arc::new(Metrics::new()));
        dispatcher
            .register::<Chat, _>(1, |msg, conn| {
                conn.send_message(2, &Chat { text: msg.text.to_uppercase() }, &SerializationFormat::Json)
            })
            .unwrap();
        let (conn, _peer) = loopback_handle(4).await;

        let frame = Frame::new(1, serde_json::to_vec(&Chat { text: "hi".into() }).unwrap());
        assert_eq!(dispatcher.dispatch(&frame, &conn), DispatchOutcome::Handled);
        assert!(conn.out_traffic() > 0);
    }
}
