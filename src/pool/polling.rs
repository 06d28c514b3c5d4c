//! Polling pool.
//!
//! A fixed number of workers repeatedly scan the registry snapshot. For each
//! connection a worker wins the busy claim on, it waits up to the poll timeout
//! for the socket to become readable, drains and decodes what is there,
//! delivers the frames in order and releases the claim. Dead connections met
//! during a scan are torn down instead of polled.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::PoolContext;
use crate::config::PoolConfig;
use crate::connection::{ConnectionHandle, DisconnectReason};
use crate::error::{constants, ProtocolError, Result};
use crate::utils::timeout::join_all_with_timeout;

/// Fixed set of workers sharing the registry through busy claims.
#[derive(Debug)]
pub struct PollingPool {
    ctx: PoolContext,
    worker_count: usize,
    poll_timeout: Duration,
    scan_interval: Duration,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingPool {
    pub fn new(ctx: PoolContext, config: &PoolConfig) -> Self {
        Self {
            ctx,
            worker_count: config.worker_count.max(1),
            poll_timeout: config.poll_timeout,
            scan_interval: config.scan_interval,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers.
    pub fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() || self.cancel.is_cancelled() {
            return Err(ProtocolError::InvalidState(
                constants::ERR_ALREADY_STARTED.to_string(),
            ));
        }

        for index in 0..self.worker_count {
            workers.push(tokio::spawn(poll_worker(
                index,
                self.ctx.clone(),
                self.poll_timeout,
                self.scan_interval,
                self.cancel.clone(),
            )));
        }
        info!(workers = self.worker_count, "Polling pool started");
        Ok(())
    }

    /// Make a connection visible to the workers.
    pub fn attach(&self, conn: Arc<ConnectionHandle>) -> Result<()> {
        self.ctx.registry.add(Arc::clone(&conn))?;
        self.ctx.announce(&conn);
        Ok(())
    }

    /// Stop scanning and join the workers. Returns the number that leaked.
    pub async fn stop(&self, shutdown_timeout: Duration) -> usize {
        self.cancel.cancel();
        let handles = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        join_all_with_timeout("polling pool", handles, shutdown_timeout).await
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }
}

#[instrument(skip(ctx, cancel), name = "poll_worker")]
async fn poll_worker(
    index: usize,
    ctx: PoolContext,
    poll_timeout: Duration,
    scan_interval: Duration,
    cancel: CancellationToken,
) {
    debug!("Worker started");

    'scan: while !cancel.is_cancelled() {
        let snapshot = ctx.registry.snapshot();
        let len = snapshot.len();

        // Start each worker at a different offset so idle connections do not
        // all queue up behind the same one.
        for entry in snapshot.iter().cycle().skip(index % len.max(1)).take(len) {
            if cancel.is_cancelled() {
                break 'scan;
            }
            let conn = &entry.handle;

            if !entry.is_alive {
                // Whoever holds the claim may still be delivering frames
                if ctx.registry.try_claim_for_teardown(conn.id()) {
                    ctx.teardown(conn, DisconnectReason::Local);
                    ctx.registry.release(conn.id());
                }
                continue;
            }
            if !ctx.registry.try_claim(conn.id()) {
                continue;
            }

            let failure = poll_claimed(&ctx, conn, poll_timeout, &cancel).await;
            if let Some(reason) = failure {
                ctx.teardown(conn, reason);
            }
            ctx.registry.release(conn.id());
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(scan_interval) => {}
        }
    }

    debug!("Worker stopped");
}

/// One poll-and-drain cycle on a connection this worker has claimed.
async fn poll_claimed(
    ctx: &PoolContext,
    conn: &Arc<ConnectionHandle>,
    poll_timeout: Duration,
    cancel: &CancellationToken,
) -> Option<DisconnectReason> {
    let ready = tokio::select! {
        biased;
        _ = cancel.cancelled() => return None,
        _ = conn.closed() => return Some(DisconnectReason::Local),
        ready = timeout(poll_timeout, conn.readable()) => ready,
    };

    match ready {
        // Nothing arrived within the poll timeout
        Err(_) => None,
        Ok(Err(e)) => Some(DisconnectReason::Transport(e.to_string())),
        Ok(Ok(())) => ctx.service_readable(conn),
    }
}
