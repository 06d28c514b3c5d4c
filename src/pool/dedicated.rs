//! Dedicated readers: one task per connection.
//!
//! The reader owns its connection for the connection's whole life, so it
//! reads, decodes and delivers without claims or queues.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::PoolContext;
use crate::connection::{ConnectionHandle, DisconnectReason};
use crate::error::Result;
use crate::utils::timeout::join_all_with_timeout;

/// Thread-per-connection strategy.
#[derive(Debug)]
pub struct DedicatedReaders {
    ctx: PoolContext,
    cancel: CancellationToken,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl DedicatedReaders {
    pub fn new(ctx: PoolContext) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Register a connection and spawn its reader.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) -> Result<()> {
        self.ctx.registry.add(Arc::clone(&conn))?;
        let reader = tokio::spawn(read_loop(conn, self.ctx.clone(), self.cancel.clone()));

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        readers.retain(|handle| !handle.is_finished());
        readers.push(reader);
        Ok(())
    }

    /// Number of readers still running.
    pub fn active_readers(&self) -> usize {
        self.readers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Cancel every reader and join them. Returns the number that leaked.
    pub async fn stop(&self, shutdown_timeout: Duration) -> usize {
        self.cancel.cancel();
        let handles = std::mem::take(
            &mut *self.readers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        join_all_with_timeout("dedicated readers", handles, shutdown_timeout).await
    }
}

/// Serve one connection until it closes, fails or the strategy stops.
///
/// On stop the connection is left for the owner to tear down.
pub(crate) async fn read_loop(
    conn: Arc<ConnectionHandle>,
    ctx: PoolContext,
    cancel: CancellationToken,
) {
    ctx.announce(&conn);

    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(connection = %conn.id(), "Reader cancelled");
                return;
            }
            _ = conn.closed() => break DisconnectReason::Local,
            ready = conn.readable() => {
                if let Err(e) = ready {
                    break DisconnectReason::Transport(e.to_string());
                }
            }
        }

        if let Some(reason) = ctx.service_readable(&conn) {
            break reason;
        }
    };

    ctx.teardown(&conn, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::{loopback_handle, EventLog};
    use crate::connection::{ConnectionRegistry, Observers};
    use crate::core::{Frame, HeaderLayout};
    use crate::utils::Metrics;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reader_delivers_and_tears_down_on_framing_error() {
        let log = Arc::new(EventLog::default());
        let metrics = Arc::new(Metrics::new());
        let registry = Arc::new(ConnectionRegistry::new());
        let readers = DedicatedReaders::new(PoolContext::new(
            Arc::clone(&registry),
            Observers::new().with(log.clone()),
            Arc::clone(&metrics),
            4096,
        ));

        let (conn, mut peer) = loopback_handle(7).await;
        readers.attach(Arc::clone(&conn)).unwrap();

        let good = Frame::new(3, &b"fine"[..])
            .to_bytes(HeaderLayout::Minimal, 1024)
            .unwrap();
        peer.write_all(&good).await.unwrap();
        // totalLength equal to the header size is never valid
        peer.write_all(&8i32.to_le_bytes()).await.unwrap();
        peer.write_all(&1i32.to_le_bytes()).await.unwrap();

        conn.closed().await;
        for _ in 0..100 {
            if log.events().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            log.events(),
            vec!["connect conn-7", "frame conn-7 3", "disconnect conn-7"]
        );
        assert!(registry.is_empty());
        assert_eq!(metrics.snapshot().framing_errors, 1);
        assert_eq!(readers.stop(Duration::from_secs(1)).await, 0);
    }
}
