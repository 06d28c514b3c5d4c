//! Bridge node: symmetric request/response between addressable peers.
//!
//! Every node listens and can issue requests. An outgoing request gets a
//! fresh correlation id and a pending entry with a deadline; the entry is
//! resolved by the matching response, by the timeout sweep, or by a send
//! failure, whichever comes first, and its completion runs exactly once.
//!
//! Requests for an unknown handler are answered with
//! [`BridgeError::NoHandler`] so callers resolve promptly instead of timing
//! out.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::identity::BridgeNodeIdentity;
use super::message::{BridgeEnvelope, BridgeMessage};
use super::pending::{PendingRequest, PendingTable, RequestOutcome};
use super::transport::{BridgeTransport, TcpLinks};
use crate::config::{BridgeConfig, BridgeTransportKind, NetworkConfig};
use crate::connection::{ConnectionHandle, ConnectionObserver, Observers};
use crate::core::serialization::{SerializationFormat, Serializer};
use crate::core::Frame;
use crate::error::{constants, BridgeError, ProtocolError, Result};
use crate::transport::DatagramEndpoint;
use crate::utils::metrics::Timer;
use crate::utils::panic::format_panic;
use crate::utils::timeout::join_all_with_timeout;
use crate::utils::Metrics;

type RequestHandler = dyn Fn(&[u8], SocketAddr) -> RequestOutcome + Send + Sync + 'static;
type Listener = dyn Fn(&[u8], SocketAddr) + Send + Sync + 'static;

/// Lifecycle of a bridge node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Listening,
}

/// A frame waiting for the sender task.
struct Outbound {
    peer: SocketAddr,
    frame: Frame,
    /// Set for requests, whose pending entry fails if the send does
    request_id: Option<Uuid>,
}

/// Everything that only exists while the node runs.
struct Running {
    transport: Arc<BridgeTransport>,
    outbound: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner<S: Serializer> {
    config: NetworkConfig,
    serializer: Arc<S>,
    identity: RwLock<BridgeNodeIdentity>,
    state: Mutex<BridgeState>,
    handlers: RwLock<HashMap<String, Arc<RequestHandler>>>,
    listeners: RwLock<Vec<Arc<Listener>>>,
    pending: PendingTable,
    running: Mutex<Option<Running>>,
    metrics: Arc<Metrics>,
}

/// A bridge node. Cheap to clone; clones share the node.
pub struct Bridge<S: Serializer = SerializationFormat> {
    inner: Arc<Inner<S>>,
}

impl<S: Serializer> Clone for Bridge<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Bridge<SerializationFormat> {
    /// Node using the default (bincode) format.
    pub fn new(config: &NetworkConfig, metrics: Arc<Metrics>) -> Result<Self> {
        Self::with_serializer(config, SerializationFormat::default(), metrics)
    }
}

impl<S: Serializer> Bridge<S> {
    /// Node using `serializer` for payloads. The whole configuration is
    /// validated first.
    pub fn with_serializer(config: &NetworkConfig, serializer: S, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate_strict()?;
        let identity = BridgeNodeIdentity::from_config(&config.bridge)?;

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                serializer: Arc::new(serializer),
                identity: RwLock::new(identity),
                state: Mutex::new(BridgeState::Stopped),
                handlers: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                pending: PendingTable::new(),
                running: Mutex::new(None),
                metrics,
            }),
        })
    }

    pub fn state(&self) -> BridgeState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Endpoint peers use to address this node (resolved after `start`).
    pub fn public_endpoint(&self) -> SocketAddr {
        self.inner.identity().public_endpoint()
    }

    /// Endpoint the transport is bound to (resolved after `start`).
    pub fn listen_endpoint(&self) -> SocketAddr {
        self.inner.identity().listen_endpoint()
    }

    /// Current identity, including every allowed peer.
    pub fn identity(&self) -> BridgeNodeIdentity {
        self.inner.identity.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Accept bridge traffic from `peer` from now on.
    pub fn allow_peer(&self, peer: SocketAddr) {
        self.inner
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .allow(peer);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Register the responder for `handler_id`.
    ///
    /// The handler runs synchronously on the receiving side; its error or
    /// panic is returned to the caller as [`BridgeError::HandlerFailed`].
    pub fn add_handler<Req, Resp, F>(&self, handler_id: &str, handler: F) -> Result<()>
    where
        Req: DeserializeOwned + 'static,
        Resp: Serialize + 'static,
        F: Fn(Req, SocketAddr) -> Result<Resp> + Send + Sync + 'static,
    {
        let serializer = Arc::clone(&self.inner.serializer);
        let id = handler_id.to_string();
        let responder: Arc<RequestHandler> = Arc::new(move |context: &[u8], origin: SocketAddr| {
            let request: Req = serializer
                .deserialize(context)
                .map_err(|e| BridgeError::Serialization(e.to_string()))?;

            match catch_unwind(AssertUnwindSafe(|| handler(request, origin))) {
                Ok(Ok(response)) => serializer
                    .serialize(&response)
                    .map_err(|e| BridgeError::Serialization(e.to_string())),
                Ok(Err(e)) => Err(BridgeError::HandlerFailed(e.to_string())),
                Err(panic) => {
                    let message = format_panic(panic).to_string();
                    error!(handler = %id, panic = %message, "Bridge handler panicked");
                    Err(BridgeError::HandlerFailed(message))
                }
            }
        });

        let mut handlers = self.inner.handlers.write().map_err(|_| {
            ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string())
        })?;
        if handlers.contains_key(handler_id) {
            return Err(ProtocolError::DuplicateHandler(handler_id.to_string()));
        }
        handlers.insert(handler_id.to_string(), responder);
        debug!(handler = handler_id, "Bridge handler registered");
        Ok(())
    }

    /// Subscribe to fire-and-forget messages decoding as `T`.
    ///
    /// Messages that do not decode as `T` are skipped by this listener.
    pub fn add_listener<T, F>(&self, on_message: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T, SocketAddr) + Send + Sync + 'static,
    {
        let serializer = Arc::clone(&self.inner.serializer);
        let listener: Arc<Listener> = Arc::new(move |payload: &[u8], origin: SocketAddr| {
            match serializer.deserialize::<T>(payload) {
                Ok(message) => on_message(message, origin),
                Err(e) => debug!(origin = %origin, error = %e, "Listener skipped message"),
            }
        });
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Bind the transport and start receiving.
    #[instrument(skip(self), fields(listen = %self.listen_endpoint()))]
    pub async fn start(&self) -> Result<()> {
        self.inner.transition(BridgeState::Stopped, BridgeState::Starting)?;

        match self.bind().await {
            Ok(running) => {
                *self.inner.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
                self.inner.set_state(BridgeState::Listening);
                info!(
                    public = %self.public_endpoint(),
                    transport = ?self.inner.config.bridge.transport,
                    "Bridge listening"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(BridgeState::Stopped);
                Err(e)
            }
        }
    }

    async fn bind(&self) -> Result<Running> {
        let bridge_config: &BridgeConfig = &self.inner.config.bridge;
        let listen = self.listen_endpoint();
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let transport = match bridge_config.transport {
            BridgeTransportKind::Udp => {
                let endpoint = Arc::new(
                    DatagramEndpoint::bind(
                        listen,
                        &self.inner.config.framing,
                        bridge_config.max_datagram_size,
                        Arc::clone(&self.inner.metrics),
                    )
                    .await?,
                );
                tasks.push(tokio::spawn(receive_loop(
                    Arc::clone(&self.inner),
                    Arc::clone(&endpoint),
                    cancel.clone(),
                )));
                BridgeTransport::Udp(endpoint)
            }
            BridgeTransportKind::Tcp => {
                let sink: Arc<dyn ConnectionObserver> = Arc::new(FrameSink {
                    inner: Arc::downgrade(&self.inner),
                });
                let links = TcpLinks::start(
                    listen,
                    &self.inner.config,
                    Observers::new().with(sink),
                    Arc::clone(&self.inner.metrics),
                )
                .await?;
                BridgeTransport::Tcp(links)
            }
        };
        let transport = Arc::new(transport);

        self.inner
            .identity
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .bound_to(transport.local_addr());

        let (tx, rx) = mpsc::unbounded_channel();
        tasks.push(tokio::spawn(send_loop(
            Arc::clone(&self.inner),
            Arc::clone(&transport),
            rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(sweep_loop(
            Arc::clone(&self.inner),
            bridge_config.sweep_interval,
            cancel.clone(),
        )));

        Ok(Running {
            transport,
            outbound: tx,
            cancel,
            tasks,
        })
    }

    /// Stop the node. Requests still pending complete with a transport error.
    pub async fn stop(&self) -> Result<()> {
        let _timer = Timer::start("bridge_stop");
        self.inner
            .transition(BridgeState::Listening, BridgeState::Stopped)?;

        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.cancel.cancel();
            join_all_with_timeout(
                "bridge",
                running.tasks,
                self.inner.config.server.shutdown_timeout,
            )
            .await;
            running.transport.shutdown().await;
        }

        for request in self.inner.pending.drain() {
            request.complete(Err(BridgeError::Transport(
                constants::ERR_CONNECTION_CLOSED.to_string(),
            )));
        }
        info!(public = %self.public_endpoint(), "Bridge stopped");
        Ok(())
    }

    /// Fire-and-forget message to `peer`; no correlation is tracked.
    pub fn send<T: Serialize + ?Sized>(&self, peer: SocketAddr, message: &T) -> Result<()> {
        let payload = self.inner.serializer.serialize(message)?;
        self.inner
            .enqueue(peer, BridgeMessage::Notify { payload }, None)
    }

    /// Issue a request and return its correlation id without waiting.
    ///
    /// `on_result` runs exactly once: with the decoded response, the remote
    /// error, [`BridgeError::Timeout`] after `timeout` (the configured request
    /// timeout when `None`), or [`BridgeError::Transport`] if sending fails.
    pub fn request<Req, Resp, F>(
        &self,
        peer: SocketAddr,
        handler_id: &str,
        context: &Req,
        timeout: Option<Duration>,
        on_result: F,
    ) -> Result<Uuid>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + 'static,
        F: FnOnce(std::result::Result<Resp, BridgeError>) + Send + 'static,
    {
        let context = self.inner.serializer.serialize(context)?;
        let id = Uuid::new_v4();
        let timeout = timeout.unwrap_or(self.inner.config.bridge.request_timeout);

        let serializer = Arc::clone(&self.inner.serializer);
        let completion = Box::new(move |outcome: RequestOutcome| {
            let typed = outcome.and_then(|bytes| {
                serializer
                    .deserialize::<Resp>(&bytes)
                    .map_err(|e| BridgeError::Serialization(e.to_string()))
            });
            on_result(typed);
        });

        self.inner.pending.insert(PendingRequest::new(
            id,
            peer,
            handler_id,
            timeout,
            completion,
        ));

        let body = BridgeMessage::Request {
            id,
            handler_id: handler_id.to_string(),
            context,
        };
        if let Err(e) = self.inner.enqueue(peer, body, Some(id)) {
            // Never sent; the caller gets the error instead of the callback
            self.inner.pending.take(&id);
            return Err(e);
        }

        self.inner.metrics.request_sent();
        debug!(request = %id, peer = %peer, handler = handler_id, "Request issued");
        Ok(id)
    }

    /// Issue a request and await its result.
    pub async fn call<Req, Resp>(
        &self,
        peer: SocketAddr,
        handler_id: &str,
        context: &Req,
        timeout: Option<Duration>,
    ) -> std::result::Result<Resp, BridgeError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.request(peer, handler_id, context, timeout, move |result| {
            let _ = tx.send(result);
        })?;

        rx.await.unwrap_or_else(|_| {
            Err(BridgeError::Transport(
                constants::ERR_CONNECTION_CLOSED.to_string(),
            ))
        })
    }
}

impl<S: Serializer> std::fmt::Debug for Bridge<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("state", &self.state())
            .field("public_endpoint", &self.public_endpoint())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl<S: Serializer> Inner<S> {
    fn identity(&self) -> RwLockReadGuard<'_, BridgeNodeIdentity> {
        self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: BridgeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn transition(&self, from: BridgeState, to: BridgeState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            let message = if from == BridgeState::Stopped {
                constants::ERR_ALREADY_STARTED
            } else {
                constants::ERR_NOT_STARTED
            };
            return Err(ProtocolError::InvalidState(format!("{message} (bridge is {:?})", *state)));
        }
        *state = to;
        Ok(())
    }

    /// Wrap `body` in an envelope from this node and queue it for sending.
    fn enqueue(&self, peer: SocketAddr, body: BridgeMessage, request_id: Option<Uuid>) -> Result<()> {
        let origin = self.identity().public_endpoint();
        let frame = BridgeEnvelope::new(origin, body).to_frame(self.serializer.as_ref())?;

        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(running) = running.as_ref() else {
            return Err(ProtocolError::InvalidState(
                constants::ERR_NOT_STARTED.to_string(),
            ));
        };
        running
            .outbound
            .send(Outbound {
                peer,
                frame,
                request_id,
            })
            .map_err(|_| ProtocolError::InvalidState(constants::ERR_NOT_STARTED.to_string()))
    }

    /// Process one inbound bridge frame.
    fn handle_frame(&self, frame: &Frame, from: SocketAddr) {
        let envelope = match BridgeEnvelope::from_frame(frame, self.serializer.as_ref()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(from = %from, error = %e, "Dropping undecodable bridge frame");
                self.metrics.deserialize_failure();
                return;
            }
        };

        let origin = envelope.origin;
        if !self.identity().is_allowed(&origin) {
            warn!(
                from = %from,
                error = %ProtocolError::PeerNotAllowed(origin.to_string()),
                "Dropping bridge frame"
            );
            return;
        }

        match envelope.body {
            BridgeMessage::Request {
                id,
                handler_id,
                context,
            } => self.answer(id, &handler_id, &context, origin),
            BridgeMessage::Response { id, result } => self.resolve(id, result, origin),
            BridgeMessage::Notify { payload } => self.notify(&payload, origin),
        }
    }

    fn answer(&self, id: Uuid, handler_id: &str, context: &[u8], origin: SocketAddr) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handler_id)
            .cloned();

        let result = match handler {
            Some(handler) => {
                self.metrics.frame_dispatched();
                handler(context, origin)
            }
            None => {
                warn!(request = %id, origin = %origin, handler = handler_id, "No bridge handler");
                self.metrics.no_handler_reply();
                Err(BridgeError::NoHandler(handler_id.to_string()))
            }
        };
        if let Err(e) = &result {
            debug!(request = %id, error = %e, "Answering with error");
            if matches!(e, BridgeError::HandlerFailed(_)) {
                self.metrics.handler_failure();
            }
        }

        if let Err(e) = self.enqueue(origin, BridgeMessage::Response { id, result }, None) {
            warn!(request = %id, origin = %origin, error = %e, "Failed to queue response");
        }
    }

    fn resolve(&self, id: Uuid, result: RequestOutcome, origin: SocketAddr) {
        match self.pending.take(&id) {
            Some(request) => {
                self.metrics.response_matched();
                debug!(
                    request = %id,
                    origin = %origin,
                    elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                    "Response matched"
                );
                request.complete(result);
            }
            None => {
                self.metrics.response_discarded();
                info!(request = %id, origin = %origin, "Discarding response with no pending request");
            }
        }
    }

    fn notify(&self, payload: &[u8], origin: SocketAddr) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if listeners.is_empty() {
            self.metrics.frame_unhandled();
            debug!(origin = %origin, "No listener for bridge message");
            return;
        }

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(payload, origin))) {
                error!(origin = %origin, panic = %format_panic(panic), "Bridge listener panicked");
                self.metrics.handler_failure();
            }
        }
    }

    fn expire(&self, now: Instant) {
        for request in self.pending.take_expired(now) {
            self.metrics.request_timeout();
            warn!(
                request = %request.id,
                peer = %request.peer,
                handler = %request.handler_id,
                "Request timed out"
            );
            request.complete(Err(BridgeError::Timeout));
        }
    }
}

/// Feeds frames from TCP bridge links into the node.
struct FrameSink<S: Serializer> {
    inner: Weak<Inner<S>>,
}

impl<S: Serializer> ConnectionObserver for FrameSink<S> {
    fn on_frame(&self, conn: &Arc<ConnectionHandle>, frame: Frame) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_frame(&frame, conn.peer_addr());
        }
    }
}

async fn receive_loop<S: Serializer>(
    inner: Arc<Inner<S>>,
    endpoint: Arc<DatagramEndpoint>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = endpoint.recv_from() => received,
        };

        match received {
            Ok((frames, from)) => {
                for frame in &frames {
                    inner.handle_frame(frame, from);
                }
            }
            // Bad datagrams only cost themselves
            Err(e) => {
                inner.metrics.framing_error();
                warn!(error = %e, "Dropping datagram");
            }
        }
    }
    debug!("Bridge receive loop stopped");
}

/// Route queued frames to the transport.
///
/// Datagrams go out inline. Stream peers each get their own lane task, so a
/// peer that takes the full connect timeout only delays its own frames.
async fn send_loop<S: Serializer>(
    inner: Arc<Inner<S>>,
    transport: Arc<BridgeTransport>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    let mut lanes: HashMap<SocketAddr, mpsc::UnboundedSender<Outbound>> = HashMap::new();
    let mut lane_tasks = Vec::new();

    loop {
        let outbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        if matches!(*transport, BridgeTransport::Udp(_)) {
            deliver(&inner, &transport, outbound).await;
            continue;
        }

        let peer = outbound.peer;
        let outbound = match lanes.get(&peer) {
            Some(lane) => match lane.send(outbound) {
                Ok(()) => continue,
                // Lane task is gone; open a fresh one below
                Err(mpsc::error::SendError(outbound)) => outbound,
            },
            None => outbound,
        };

        let (lane, lane_rx) = mpsc::unbounded_channel();
        if lane.send(outbound).is_err() {
            continue;
        }
        lane_tasks.retain(|task: &JoinHandle<()>| !task.is_finished());
        lane_tasks.push(tokio::spawn(peer_lane(
            Arc::clone(&inner),
            Arc::clone(&transport),
            peer,
            lane_rx,
            cancel.clone(),
        )));
        lanes.insert(peer, lane);
        debug!(peer = %peer, lanes = lanes.len(), "Bridge send lane opened");
    }

    drop(lanes);
    join_all_with_timeout(
        "bridge send lanes",
        lane_tasks,
        inner.config.server.shutdown_timeout,
    )
    .await;
    debug!("Bridge send loop stopped");
}

/// Sends to one stream peer, in queue order.
async fn peer_lane<S: Serializer>(
    inner: Arc<Inner<S>>,
    transport: Arc<BridgeTransport>,
    peer: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let outbound = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = deliver(&inner, &transport, outbound) => {}
        }
    }
    debug!(peer = %peer, "Bridge send lane stopped");
}

/// Send one frame. A failed request send resolves its pending entry.
async fn deliver<S: Serializer>(inner: &Inner<S>, transport: &BridgeTransport, outbound: Outbound) {
    if let Err(e) = transport.send(&outbound.frame, outbound.peer).await {
        inner.metrics.transport_error();
        warn!(peer = %outbound.peer, error = %e, "Bridge send failed");
        let failed = outbound.request_id.and_then(|id| inner.pending.take(&id));
        if let Some(request) = failed {
            request.complete(Err(BridgeError::Transport(e.to_string())));
        }
    }
}

async fn sweep_loop<S: Serializer>(
    inner: Arc<Inner<S>>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.expire(Instant::now()),
        }
    }
    debug!("Bridge sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_node() -> Bridge {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.bridge.listen_endpoint = "127.0.0.1:0".to_string();
        });
        Bridge::new(&config, Arc::new(Metrics::new())).unwrap()
    }

    #[test]
    fn test_duplicate_handler_rejected() {
        let node = local_node();
        node.add_handler("echo", |text: String, _| Ok(text)).unwrap();

        let err = node
            .add_handler("echo", |n: u32, _| Ok(n + 1))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::DuplicateHandler(id) if id == "echo"));
    }

    #[test]
    fn test_request_before_start_fails_without_pending_entry() {
        let node = local_node();
        let peer = "127.0.0.1:9".parse().unwrap();

        let result = node.request(peer, "echo", "hi", None, |_: std::result::Result<String, _>| {});
        assert!(matches!(result, Err(ProtocolError::InvalidState(_))));
        assert_eq!(node.pending_count(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.bridge.listen_endpoint = "127.0.0.1:0".to_string();
            c.server.read_chunk_size = 0;
        });

        let result = Bridge::new(&config, Arc::new(Metrics::new()));
        assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let node = local_node();
        assert_eq!(node.state(), BridgeState::Stopped);
        assert!(node.stop().await.is_err());

        node.start().await.unwrap();
        assert_eq!(node.state(), BridgeState::Listening);
        assert_ne!(node.public_endpoint().port(), 0);
        assert!(node.identity().is_allowed(&node.public_endpoint()));
        assert!(node.start().await.is_err());

        node.stop().await.unwrap();
        assert_eq!(node.state(), BridgeState::Stopped);
    }
}
