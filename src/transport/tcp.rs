//! TCP server and client.
//!
//! The server accepts connections, assigns ids and units of order, and hands
//! each one to the configured [`WorkerPool`]. The client wraps one outbound
//! connection served by a dedicated reader. Both report through the same
//! [`Observers`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{FramingConfig, NetworkConfig};
use crate::connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, DisconnectReason, Observers,
};
use crate::core::serialization::Serializer;
use crate::core::Frame;
use crate::error::{constants, ProtocolError, Result};
use crate::pool::{dedicated, PoolContext, WorkerPool, WorkerStrategy};
use crate::utils::metrics::Timer;
use crate::utils::timeout::{join_all_with_timeout, with_timeout_error, DEFAULT_TIMEOUT};
use crate::utils::Metrics;

/// Ids for client-side connections, kept apart from server-assigned ones.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1 << 48);

/// Back-off after a failed `accept()` (e.g. file descriptor exhaustion)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Everything the accept loop needs to build a connection.
#[derive(Debug, Clone)]
struct AcceptSettings {
    max_connections: usize,
    units_of_order: usize,
    framing: FramingConfig,
}

/// Listening TCP server feeding a worker pool.
pub struct TcpServer {
    local_addr: SocketAddr,
    ctx: PoolContext,
    pool: Arc<WorkerPool>,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl TcpServer {
    /// Bind `config.server.address`, start the pool and begin accepting.
    #[instrument(skip(config, observers, metrics), fields(address = %config.server.address))]
    pub async fn start(
        config: &NetworkConfig,
        observers: Observers,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let addr: SocketAddr = config.server.address.parse().map_err(|_| {
            ProtocolError::ConfigError(format!(
                "Invalid server address: '{}'",
                config.server.address
            ))
        })?;

        let listener = listen(addr, config.server.backlog)?;
        let local_addr = listener.local_addr()?;

        let ctx = PoolContext::new(
            Arc::new(ConnectionRegistry::new()),
            observers,
            Arc::clone(&metrics),
            config.server.read_chunk_size,
        );
        let pool = Arc::new(WorkerPool::start(ctx.clone(), &config.pool)?);

        let settings = AcceptSettings {
            max_connections: config.server.max_connections,
            units_of_order: config.pool.max_unit_of_order.max(1),
            framing: config.framing.clone(),
        };
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&pool),
            ctx.clone(),
            settings,
            cancel.clone(),
        ));

        info!(
            address = %local_addr,
            strategy = ?config.pool.strategy,
            backlog = config.server.backlog,
            "Server listening"
        );

        Ok(Self {
            local_addr,
            ctx,
            pool,
            cancel,
            accept_task: Mutex::new(Some(accept_task)),
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn strategy(&self) -> WorkerStrategy {
        self.pool.strategy()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.ctx.registry
    }

    pub fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.ctx.metrics
    }

    /// Stop accepting, join the workers and tear down every live connection.
    ///
    /// Each connection still open gets exactly one disconnect event with
    /// [`DisconnectReason::Shutdown`]. Returns the number of leaked workers.
    pub async fn stop(&self) -> usize {
        let _timer = Timer::start("tcp_server_stop");
        self.cancel.cancel();

        let accept = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut leaked = 0;
        if let Some(handle) = accept {
            leaked += join_all_with_timeout("tcp accept loop", vec![handle], self.shutdown_timeout)
                .await;
        }
        leaked += self.pool.stop(self.shutdown_timeout).await;

        let remaining = self.ctx.registry.snapshot();
        for entry in &remaining {
            self.ctx.teardown(&entry.handle, DisconnectReason::Shutdown);
        }

        info!(
            address = %self.local_addr,
            closed = remaining.len(),
            leaked,
            "Server stopped"
        );
        leaked
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.local_addr)
            .field("strategy", &self.pool.strategy())
            .field("connections", &self.ctx.registry.len())
            .finish()
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

async fn accept_loop(
    listener: TcpListener,
    pool: Arc<WorkerPool>,
    ctx: PoolContext,
    settings: AcceptSettings,
    cancel: CancellationToken,
) {
    let mut next_id: u64 = 1;

    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        if ctx.registry.len() >= settings.max_connections {
            warn!(
                peer = %peer,
                limit = settings.max_connections,
                "{}; refusing connection",
                constants::ERR_CONNECTION_LIMIT
            );
            ctx.metrics.connection_rejected();
            drop(stream);
            continue;
        }

        let id = next_id;
        next_id += 1;
        let unit_of_order = (id % settings.units_of_order as u64) as usize;

        let conn = match ConnectionHandle::spawn(
            stream,
            ConnectionId(id),
            unit_of_order,
            settings.framing.layout,
            settings.framing.max_message_size,
            Arc::clone(&ctx.metrics),
        ) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to set up accepted connection");
                continue;
            }
        };

        ctx.metrics.connection_established();
        info!(connection = %conn.id(), peer = %peer, unit_of_order, "Connection accepted");

        if let Err(e) = pool.attach(Arc::clone(&conn)) {
            warn!(connection = %conn.id(), error = %e, "Pool refused connection");
            conn.close();
            ctx.metrics.connection_closed();
        }
    }

    debug!("Accept loop stopped");
}

/// One outbound connection with its own reader.
pub struct TcpClient {
    conn: Arc<ConnectionHandle>,
    ctx: PoolContext,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClient {
    /// Connect to `addr` and start reading. Frames and the eventual
    /// disconnect are reported to `observers`.
    #[instrument(skip(config, observers, metrics))]
    pub async fn connect(
        addr: SocketAddr,
        config: &NetworkConfig,
        observers: Observers,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let stream = with_timeout_error(
            async { TcpStream::connect(addr).await.map_err(ProtocolError::from) },
            DEFAULT_TIMEOUT,
        )
        .await?;

        let id = ConnectionId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
        let conn = ConnectionHandle::spawn(
            stream,
            id,
            0,
            config.framing.layout,
            config.framing.max_message_size,
            Arc::clone(&metrics),
        )?;

        let ctx = PoolContext::new(
            Arc::new(ConnectionRegistry::new()),
            observers,
            Arc::clone(&metrics),
            config.server.read_chunk_size,
        );
        ctx.registry.add(Arc::clone(&conn))?;
        metrics.connection_established();
        info!(connection = %id, peer = %addr, "Connected");

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(dedicated::read_loop(
            Arc::clone(&conn),
            ctx.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            conn,
            ctx,
            cancel,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionHandle> {
        &self.conn
    }

    pub fn is_alive(&self) -> bool {
        self.conn.is_alive()
    }

    pub fn send_frame(&self, frame: Frame) -> Result<()> {
        self.conn.send_frame(frame)
    }

    pub fn send_message<T, S>(&self, message_type_id: i32, message: &T, serializer: &S) -> Result<()>
    where
        T: Serialize + ?Sized,
        S: Serializer,
    {
        self.conn.send_message(message_type_id, message, serializer)
    }

    /// Close the connection and wait for the reader to finish.
    pub async fn close(&self) {
        self.conn.close();
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            if join_all_with_timeout("tcp client reader", vec![handle], DEFAULT_TIMEOUT).await > 0 {
                // The reader never got to announce the disconnect
                self.ctx.teardown(&self.conn, DisconnectReason::Local);
            }
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.conn.close();
    }
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("connection", &self.conn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::EventLog;

    fn local_config(strategy: WorkerStrategy) -> NetworkConfig {
        NetworkConfig::default_with_overrides(|c| {
            c.server.address = "127.0.0.1:0".to_string();
            c.server.shutdown_timeout = Duration::from_secs(1);
            c.pool.strategy = strategy;
            c.pool.poll_timeout = Duration::from_millis(10);
            c.pool.scan_interval = Duration::from_millis(1);
        })
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_client_server_exchange_all_strategies() {
        for strategy in [
            WorkerStrategy::Polling,
            WorkerStrategy::OrderedQueue,
            WorkerStrategy::Dedicated,
        ] {
            let config = local_config(strategy);
            let server_log = Arc::new(EventLog::default());
            let server = TcpServer::start(
                &config,
                Observers::new().with(server_log.clone()),
                Arc::new(Metrics::new()),
            )
            .await
            .unwrap();

            let client = TcpClient::connect(
                server.local_addr(),
                &config,
                Observers::new(),
                Arc::new(Metrics::new()),
            )
            .await
            .unwrap();
            for id in [10, 11, 12] {
                client.send_frame(Frame::new(id, &b"abc"[..])).unwrap();
            }

            wait_until(|| server_log.events().len() == 4).await;
            assert_eq!(
                server_log.events(),
                vec!["connect conn-1", "frame conn-1 10", "frame conn-1 11", "frame conn-1 12"],
                "strategy {strategy:?}"
            );

            server.stop().await;
            wait_until(|| server_log.events().len() == 5).await;
            assert_eq!(server_log.events()[4], "disconnect conn-1");
            assert_eq!(server.connection_count(), 0);
            client.close().await;
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_start() {
        let mut config = local_config(WorkerStrategy::Polling);
        config.server.read_chunk_size = 0;

        let result = TcpServer::start(&config, Observers::new(), Arc::new(Metrics::new())).await;
        assert!(matches!(
            result,
            Err(ProtocolError::ConfigError(msg)) if msg.contains("Read chunk size")
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_connections_enforced() {
        let mut config = local_config(WorkerStrategy::Dedicated);
        config.server.max_connections = 1;
        let metrics = Arc::new(Metrics::new());
        let server = TcpServer::start(&config, Observers::new(), Arc::clone(&metrics))
            .await
            .unwrap();

        let _first = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_until(|| server.connection_count() == 1).await;
        let _second = TcpStream::connect(server.local_addr()).await.unwrap();
        wait_until(|| metrics.snapshot().connections_rejected == 1).await;

        assert_eq!(server.connection_count(), 1);
        assert_eq!(metrics.snapshot().connections_rejected, 1);
        server.stop().await;
    }
}
