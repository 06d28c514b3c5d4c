//! # Worker Pools
//!
//! Strategies for servicing many connections with bounded workers. All of
//! them feed the same codec and report through the same [`Observers`]:
//!
//! - [`PollingPool`]: `W` workers scan the registry and claim one connection
//!   at a time for a read-and-drain cycle.
//! - [`OrderedQueuePool`]: connections map to one of `U` buckets; each bucket
//!   has a single consumer draining a FIFO of connection events.
//! - [`DedicatedReaders`]: one reader task per connection.
//!
//! Whatever the strategy, a connection's frames reach observers in the order
//! the peer wrote them, and a framing or socket failure tears down only that
//! connection.

pub mod dedicated;
pub mod ordered;
pub mod polling;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{PoolConfig, MIN_READ_CHUNK_SIZE};
use crate::connection::{ConnectionHandle, ConnectionRegistry, DisconnectReason, Observers};
use crate::core::Frame;
use crate::error::{ProtocolError, Result};
use crate::utils::Metrics;

pub use dedicated::DedicatedReaders;
pub use ordered::{ConnectionEvent, OrderedQueuePool};
pub use polling::PollingPool;

/// Concurrency strategy used by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStrategy {
    /// Fixed workers round-robin over the registry
    #[default]
    Polling,
    /// One FIFO consumer per unit of order
    OrderedQueue,
    /// One reader task per connection
    Dedicated,
}

/// A running pool of the configured strategy.
#[derive(Debug)]
pub enum WorkerPool {
    Polling(PollingPool),
    OrderedQueue(OrderedQueuePool),
    Dedicated(DedicatedReaders),
}

impl WorkerPool {
    /// Build the strategy named in `config` and start its workers.
    pub fn start(ctx: PoolContext, config: &PoolConfig) -> Result<Self> {
        let pool = match config.strategy {
            WorkerStrategy::Polling => {
                let pool = PollingPool::new(ctx, config);
                pool.start()?;
                WorkerPool::Polling(pool)
            }
            WorkerStrategy::OrderedQueue => {
                WorkerPool::OrderedQueue(OrderedQueuePool::start(ctx, config.max_unit_of_order))
            }
            WorkerStrategy::Dedicated => WorkerPool::Dedicated(DedicatedReaders::new(ctx)),
        };
        Ok(pool)
    }

    pub fn strategy(&self) -> WorkerStrategy {
        match self {
            WorkerPool::Polling(_) => WorkerStrategy::Polling,
            WorkerPool::OrderedQueue(_) => WorkerStrategy::OrderedQueue,
            WorkerPool::Dedicated(_) => WorkerStrategy::Dedicated,
        }
    }

    /// Hand a freshly accepted connection to the pool.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) -> Result<()> {
        match self {
            WorkerPool::Polling(pool) => pool.attach(conn),
            WorkerPool::OrderedQueue(pool) => pool.attach(conn),
            WorkerPool::Dedicated(pool) => pool.attach(conn),
        }
    }

    /// Stop and join every worker. Returns the number that leaked.
    pub async fn stop(&self, shutdown_timeout: Duration) -> usize {
        match self {
            WorkerPool::Polling(pool) => pool.stop(shutdown_timeout).await,
            WorkerPool::OrderedQueue(pool) => pool.stop(shutdown_timeout).await,
            WorkerPool::Dedicated(pool) => pool.stop(shutdown_timeout).await,
        }
    }
}

/// State shared by every worker of a pool.
#[derive(Debug, Clone)]
pub struct PoolContext {
    pub registry: Arc<ConnectionRegistry>,
    pub observers: Observers,
    pub metrics: Arc<Metrics>,
    pub read_chunk_size: usize,
}

impl PoolContext {
    /// `read_chunk_size` is raised to [`MIN_READ_CHUNK_SIZE`]; a zero-sized
    /// read would look like end of stream.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        observers: Observers,
        metrics: Arc<Metrics>,
        read_chunk_size: usize,
    ) -> Self {
        Self {
            registry,
            observers,
            metrics,
            read_chunk_size: read_chunk_size.max(MIN_READ_CHUNK_SIZE),
        }
    }

    /// Raise the connect event. Only announced connections get a disconnect.
    pub(crate) fn announce(&self, conn: &Arc<ConnectionHandle>) {
        conn.mark_announced();
        self.observers.notify_connected(conn);
    }

    /// Close, unregister and announce a dead connection.
    ///
    /// Safe to call from several places; only the first call has any effect,
    /// so observers see at most one disconnect, and none for a connection
    /// whose connect event never fired.
    pub fn teardown(&self, conn: &Arc<ConnectionHandle>, reason: DisconnectReason) {
        if !conn.begin_teardown() {
            return;
        }

        conn.close();
        self.registry.remove(conn.id());
        self.metrics.connection_closed();
        match &reason {
            DisconnectReason::Framing(_) => self.metrics.framing_error(),
            DisconnectReason::Transport(_) => self.metrics.transport_error(),
            _ => {}
        }

        info!(
            connection = %conn.id(),
            peer = %conn.peer_addr(),
            in_bytes = conn.in_traffic(),
            out_bytes = conn.out_traffic(),
            %reason,
            "Connection closed"
        );
        if conn.was_announced() {
            self.observers.notify_disconnected(conn, &reason);
        }
    }

    /// Read what the socket has buffered and deliver every completed frame.
    ///
    /// Returns the reason the connection must be torn down, if any. Frames
    /// decoded before a violation are still delivered first.
    pub(crate) fn service_readable(&self, conn: &Arc<ConnectionHandle>) -> Option<DisconnectReason> {
        let chunk = match conn.drain_readable(self.read_chunk_size) {
            Ok(chunk) => chunk,
            Err(e) => return Some(DisconnectReason::Transport(e.to_string())),
        };

        let mut failure = None;
        if !chunk.data.is_empty() {
            self.metrics.bytes_read(chunk.data.len() as u64);
            let (frames, error) = decode_chunk(conn, &chunk.data);
            self.deliver(conn, frames);
            failure = error.map(framing_reason);
        }

        failure.or(chunk.eof.then_some(DisconnectReason::Closed))
    }

    pub(crate) fn deliver(&self, conn: &Arc<ConnectionHandle>, frames: Vec<Frame>) {
        for frame in frames {
            self.metrics.frame_received();
            self.observers.notify_frame(conn, frame);
        }
    }
}

/// Feed `data` to the connection's codec, collecting frames until the
/// buffer runs dry or a violation stops decoding.
pub(crate) fn decode_chunk(
    conn: &ConnectionHandle,
    data: &[u8],
) -> (Vec<Frame>, Option<ProtocolError>) {
    let mut codec = conn.codec();
    codec.extend(data);

    let mut frames = Vec::new();
    loop {
        match codec.next_frame() {
            Ok(Some(frame)) => frames.push(frame),
            Ok(None) => return (frames, None),
            Err(e) => return (frames, Some(e)),
        }
    }
}

pub(crate) fn framing_reason(err: ProtocolError) -> DisconnectReason {
    match err {
        ProtocolError::Framing(_) | ProtocolError::OversizedFrame(_) => {
            DisconnectReason::Framing(err.to_string())
        }
        other => DisconnectReason::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{loopback_handle, EventLog};
    use tokio::io::AsyncWriteExt;

    fn context(observer: Arc<EventLog>) -> PoolContext {
        PoolContext::new(
            Arc::new(ConnectionRegistry::new()),
            Observers::new().with(observer),
            Arc::new(Metrics::new()),
            4096,
        )
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&WorkerStrategy::OrderedQueue).unwrap();
        assert_eq!(json, "\"ordered_queue\"");
        let back: WorkerStrategy = serde_json::from_str("\"dedicated\"").unwrap();
        assert_eq!(back, WorkerStrategy::Dedicated);
    }

    #[tokio::test]
    async fn test_teardown_fires_once() {
        let log = Arc::new(EventLog::default());
        let ctx = context(Arc::clone(&log));
        let (conn, _peer) = loopback_handle(1).await;
        ctx.registry.add(Arc::clone(&conn)).unwrap();
        ctx.announce(&conn);

        ctx.teardown(&conn, DisconnectReason::Closed);
        ctx.teardown(&conn, DisconnectReason::Shutdown);

        assert!(!conn.is_alive());
        assert!(ctx.registry.is_empty());
        assert_eq!(log.events(), vec!["connect conn-1", "disconnect conn-1"]);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_still_reads() {
        let log = Arc::new(EventLog::default());
        let ctx = PoolContext::new(
            Arc::new(ConnectionRegistry::new()),
            Observers::new().with(log.clone()),
            Arc::new(Metrics::new()),
            0,
        );
        assert_eq!(ctx.read_chunk_size, MIN_READ_CHUNK_SIZE);

        let (conn, mut peer) = loopback_handle(4).await;
        let bytes = Frame::new(9, &b"ok"[..]).to_bytes(conn.layout(), 1024).unwrap();
        peer.write_all(&bytes).await.unwrap();

        conn.readable().await.unwrap();
        let mut reason = None;
        for _ in 0..50 {
            reason = ctx.service_readable(&conn);
            if !log.events().is_empty() || reason.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(reason.is_none(), "{reason:?}");
        assert_eq!(log.events(), vec!["frame conn-4 9"]);
    }

    #[tokio::test]
    async fn test_unannounced_connection_closes_silently() {
        let log = Arc::new(EventLog::default());
        let ctx = context(Arc::clone(&log));
        let (conn, _peer) = loopback_handle(3).await;
        ctx.registry.add(Arc::clone(&conn)).unwrap();

        ctx.teardown(&conn, DisconnectReason::Shutdown);

        assert!(!conn.is_alive());
        assert!(ctx.registry.is_empty());
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_frames_before_violation_are_delivered() {
        let log = Arc::new(EventLog::default());
        let ctx = context(Arc::clone(&log));
        let (conn, mut peer) = loopback_handle(2).await;

        let mut bytes = Frame::new(7, &b"ok"[..])
            .to_bytes(conn.layout(), 1024)
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        peer.write_all(&bytes).await.unwrap();

        conn.readable().await.unwrap();
        let mut reason = None;
        for _ in 0..50 {
            reason = ctx.service_readable(&conn);
            if reason.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        assert!(matches!(reason, Some(DisconnectReason::Framing(_))));
        assert_eq!(log.events(), vec!["frame conn-2 7"]);
    }
}
