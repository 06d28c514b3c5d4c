//! Ordered-queue pool.
//!
//! Each connection belongs to one unit of order (`unit_of_order % U`). Every
//! bucket owns a FIFO and exactly one consumer, so all events of a connection
//! are handled in the order they were pushed, while different buckets run in
//! parallel. Socket reads happen in a per-connection producer task that only
//! pushes raw chunks; decoding and delivery belong to the bucket consumer.
//!
//! Stopping cancels the consumers' wait directly, so it completes promptly
//! even with a full backlog. Queued events are dropped; a connection whose
//! connect event was dropped never gets a disconnect event either.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::{decode_chunk, framing_reason, PoolContext};
use crate::connection::{ConnectionHandle, DisconnectReason};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::join_all_with_timeout;

/// One entry of a bucket queue.
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected(Arc<ConnectionHandle>),
    /// Raw bytes as read from the socket, not yet decoded
    Data(Arc<ConnectionHandle>, Bytes),
    Disconnected(Arc<ConnectionHandle>, DisconnectReason),
}

impl ConnectionEvent {
    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        match self {
            ConnectionEvent::Connected(conn)
            | ConnectionEvent::Data(conn, _)
            | ConnectionEvent::Disconnected(conn, _) => conn,
        }
    }
}

/// Bucketed FIFO consumers, one per unit of order.
#[derive(Debug)]
pub struct OrderedQueuePool {
    ctx: PoolContext,
    queues: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    cancel: CancellationToken,
    consumers: Mutex<Vec<JoinHandle<()>>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl OrderedQueuePool {
    /// Create the pool and spawn one consumer per bucket.
    pub fn start(ctx: PoolContext, units_of_order: usize) -> Self {
        let units = units_of_order.max(1);
        let cancel = CancellationToken::new();
        let mut queues = Vec::with_capacity(units);
        let mut consumers = Vec::with_capacity(units);

        for bucket in 0..units {
            let (tx, rx) = mpsc::unbounded_channel();
            queues.push(tx);
            consumers.push(tokio::spawn(consume_bucket(
                bucket,
                ctx.clone(),
                rx,
                cancel.clone(),
            )));
        }
        info!(units, "Ordered-queue pool started");

        Self {
            ctx,
            queues,
            cancel,
            consumers: Mutex::new(consumers),
            readers: Mutex::new(Vec::new()),
        }
    }

    pub fn units_of_order(&self) -> usize {
        self.queues.len()
    }

    /// Bucket serving a connection.
    pub fn bucket_of(&self, conn: &ConnectionHandle) -> usize {
        conn.unit_of_order() % self.queues.len()
    }

    /// Push an event onto the queue of the connection's bucket.
    pub fn submit(&self, event: ConnectionEvent) -> Result<()> {
        let bucket = self.bucket_of(event.connection());
        self.queues[bucket]
            .send(event)
            .map_err(|_| ProtocolError::InvalidState(constants::ERR_NOT_STARTED.to_string()))
    }

    /// Register a connection, queue its connect event and start its reader.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) -> Result<()> {
        self.ctx.registry.add(Arc::clone(&conn))?;
        self.submit(ConnectionEvent::Connected(Arc::clone(&conn)))?;

        let bucket = self.bucket_of(&conn);
        let reader = tokio::spawn(read_loop(
            conn,
            self.ctx.clone(),
            self.queues[bucket].clone(),
            self.cancel.clone(),
        ));

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        readers.retain(|handle| !handle.is_finished());
        readers.push(reader);
        Ok(())
    }

    /// Cancel consumers and readers and join them. Returns the number that leaked.
    pub async fn stop(&self, shutdown_timeout: Duration) -> usize {
        self.cancel.cancel();
        let mut handles = std::mem::take(
            &mut *self.consumers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        handles.extend(std::mem::take(
            &mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner),
        ));
        join_all_with_timeout("ordered-queue pool", handles, shutdown_timeout).await
    }
}

async fn consume_bucket(
    bucket: usize,
    ctx: PoolContext,
    mut rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    cancel: CancellationToken,
) {
    debug!(bucket, "Bucket consumer started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(&ctx, event);
    }

    debug!(bucket, "Bucket consumer stopped");
}

fn handle_event(ctx: &PoolContext, event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected(conn) => ctx.announce(&conn),
        ConnectionEvent::Data(conn, data) => {
            trace!(connection = %conn.id(), bytes = data.len(), "Data event");
            let (frames, error) = decode_chunk(&conn, &data);
            ctx.deliver(&conn, frames);
            if let Some(e) = error {
                ctx.teardown(&conn, framing_reason(e));
            }
        }
        ConnectionEvent::Disconnected(conn, reason) => ctx.teardown(&conn, reason),
    }
}

/// Producer: read the socket and push raw chunks to the bucket queue.
async fn read_loop(
    conn: Arc<ConnectionHandle>,
    ctx: PoolContext,
    queue: mpsc::UnboundedSender<ConnectionEvent>,
    cancel: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = conn.closed() => break DisconnectReason::Local,
            ready = conn.readable() => {
                if let Err(e) = ready {
                    break DisconnectReason::Transport(e.to_string());
                }
            }
        }

        match conn.drain_readable(ctx.read_chunk_size) {
            Ok(chunk) => {
                if !chunk.data.is_empty() {
                    ctx.metrics.bytes_read(chunk.data.len() as u64);
                    let data = chunk.data.freeze();
                    if queue.send(ConnectionEvent::Data(Arc::clone(&conn), data)).is_err() {
                        return;
                    }
                }
                if chunk.eof {
                    break DisconnectReason::Closed;
                }
            }
            Err(e) => break DisconnectReason::Transport(e.to_string()),
        }
    };

    let _ = queue.send(ConnectionEvent::Disconnected(conn, reason));
}
