//! Live connection handle.
//!
//! A [`ConnectionHandle`] owns one accepted or connected TCP stream. Reads go
//! through the handle directly and are only ever performed by whichever worker
//! currently services the connection. Writes are queued and drained in order
//! by a per-connection writer task, so handlers can reply synchronously
//! without blocking the worker that dispatched them.
//!
//! Liveness is a [`CancellationToken`]: a connection is alive until the token
//! is cancelled, whether by a failed write, a worker tearing it down, or an
//! explicit close.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::BytesMut;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::serialization::Serializer;
use crate::core::{Frame, FrameCodec, HeaderLayout};
use crate::error::{ProtocolError, Result};
use crate::utils::Metrics;

/// Upper bound on reads performed in one drain, so one busy peer cannot hold a
/// worker forever.
const MAX_READS_PER_DRAIN: usize = 64;

/// Process-unique connection identifier, assigned at accept/connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bytes drained from a readable socket.
#[derive(Debug, Default)]
pub struct ReadChunk {
    pub data: BytesMut,
    /// The peer closed its side of the stream
    pub eof: bool,
}

/// Handle to one live stream connection.
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    unit_of_order: usize,
    layout: HeaderLayout,
    max_message_size: usize,
    reader: OwnedReadHalf,
    outbound: mpsc::UnboundedSender<Frame>,
    /// Decode state; only touched by the worker that currently owns the connection
    codec: Mutex<FrameCodec>,
    closed: CancellationToken,
    /// Observers have seen the connect event
    announced: AtomicBool,
    disconnect_fired: AtomicBool,
    in_traffic: AtomicU64,
    out_traffic: AtomicU64,
}

impl ConnectionHandle {
    /// Wrap a stream and start its writer task. Must run inside a Tokio runtime.
    pub fn spawn(
        stream: TcpStream,
        id: ConnectionId,
        unit_of_order: usize,
        layout: HeaderLayout,
        max_message_size: usize,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let handle = Arc::new(Self {
            id,
            peer_addr,
            local_addr,
            unit_of_order,
            layout,
            max_message_size,
            reader,
            outbound: tx,
            codec: Mutex::new(FrameCodec::new(layout, max_message_size)),
            closed: closed.clone(),
            announced: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
            in_traffic: AtomicU64::new(0),
            out_traffic: AtomicU64::new(0),
        });

        let framed = FramedWrite::new(writer, FrameCodec::new(layout, max_message_size));
        tokio::spawn(write_loop(id, framed, rx, closed, metrics));

        Ok(handle)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Ordered bucket this connection belongs to
    pub fn unit_of_order(&self) -> usize {
        self.unit_of_order
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Bytes read from this connection so far
    pub fn in_traffic(&self) -> u64 {
        self.in_traffic.load(Ordering::Relaxed)
    }

    /// Bytes queued for writing on this connection so far
    pub fn out_traffic(&self) -> u64 {
        self.out_traffic.load(Ordering::Relaxed)
    }

    /// Queue a frame for sending. Frames go out in the order they are queued.
    ///
    /// Size and shape are checked here, so a bad frame is refused without
    /// affecting the connection.
    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        if !self.is_alive() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let total = frame.check(self.layout, self.max_message_size)?;

        self.outbound
            .send(frame)
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.out_traffic.fetch_add(total as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Serialize `message` and queue it under `message_type_id`.
    pub fn send_message<T, S>(&self, message_type_id: i32, message: &T, serializer: &S) -> Result<()>
    where
        T: Serialize + ?Sized,
        S: Serializer,
    {
        let payload = serializer.serialize(message)?;
        self.send_frame(Frame::new(message_type_id, payload))
    }

    /// Mark the connection dead. Readers and the writer stop at their next
    /// await point; frames already queued are still flushed.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!(connection = %self.id, "Closing connection");
            self.closed.cancel();
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Wait until the socket has data (or EOF) to read.
    pub(crate) async fn readable(&self) -> io::Result<()> {
        self.reader.readable().await
    }

    /// Read everything currently available without blocking.
    pub(crate) fn drain_readable(&self, chunk_size: usize) -> io::Result<ReadChunk> {
        let mut out = ReadChunk::default();
        let mut scratch = vec![0u8; chunk_size];

        for _ in 0..MAX_READS_PER_DRAIN {
            match self.reader.try_read(&mut scratch) {
                Ok(0) => {
                    out.eof = true;
                    break;
                }
                Ok(n) => out.data.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.in_traffic
            .fetch_add(out.data.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Lock the decode state. Callers must own the connection (busy claim,
    /// bucket worker or dedicated reader), so the lock is never contended.
    pub(crate) fn codec(&self) -> MutexGuard<'_, FrameCodec> {
        self.codec.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    /// Whether a connect event was raised, and so a disconnect event is owed.
    pub(crate) fn was_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Returns true exactly once: for the caller that gets to raise the
    /// disconnect event.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.disconnect_fired.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("unit_of_order", &self.unit_of_order)
            .field("alive", &self.is_alive())
            .finish()
    }
}

async fn write_loop(
    id: ConnectionId,
    mut framed: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
    metrics: Arc<Metrics>,
) {
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => {
                let Some(frame) = next else { break };
                let total = frame.total_length(framed.encoder().layout()) as u64;
                if let Err(e) = framed.send(frame).await {
                    warn!(connection = %id, error = %e, "Write failed; closing connection");
                    metrics.transport_error();
                    closed.cancel();
                    break;
                }
                metrics.frame_sent(total);
            }
            _ = closed.cancelled() => {
                // Flush what was queued before the close
                while let Ok(frame) = rx.try_recv() {
                    if framed.send(frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = framed.get_mut().shutdown().await;
    debug!(connection = %id, "Writer stopped");
}
