//! Transports carrying bridge frames between nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::connection::Observers;
use crate::core::Frame;
use crate::error::Result;
use crate::transport::{DatagramEndpoint, TcpClient, TcpServer};
use crate::utils::Metrics;

/// Bound transport of a running bridge node.
#[derive(Debug)]
pub(crate) enum BridgeTransport {
    Udp(Arc<DatagramEndpoint>),
    Tcp(TcpLinks),
}

impl BridgeTransport {
    pub(crate) fn local_addr(&self) -> SocketAddr {
        match self {
            BridgeTransport::Udp(endpoint) => endpoint.local_addr(),
            BridgeTransport::Tcp(links) => links.server.local_addr(),
        }
    }

    /// Send one frame to `peer`. Failures are reported, never retried.
    pub(crate) async fn send(&self, frame: &Frame, peer: SocketAddr) -> Result<()> {
        match self {
            BridgeTransport::Udp(endpoint) => endpoint.send_to(frame, peer).await,
            BridgeTransport::Tcp(links) => links.send(frame, peer).await,
        }
    }

    pub(crate) async fn shutdown(&self) {
        if let BridgeTransport::Tcp(links) = self {
            links.shutdown().await;
        }
    }
}

/// Inbound server plus one lazily opened outbound stream per peer.
#[derive(Debug)]
pub(crate) struct TcpLinks {
    server: TcpServer,
    peers: Mutex<HashMap<SocketAddr, Arc<TcpClient>>>,
    config: NetworkConfig,
    observers: Observers,
    metrics: Arc<Metrics>,
}

impl TcpLinks {
    pub(crate) async fn start(
        listen: SocketAddr,
        config: &NetworkConfig,
        observers: Observers,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut config = config.clone();
        config.server.address = listen.to_string();
        let server = TcpServer::start(&config, observers.clone(), Arc::clone(&metrics)).await?;

        Ok(Self {
            server,
            peers: Mutex::new(HashMap::new()),
            config,
            observers,
            metrics,
        })
    }

    async fn link_to(&self, peer: SocketAddr) -> Result<Arc<TcpClient>> {
        let existing = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&peer)
            .cloned();
        if let Some(client) = existing {
            if client.is_alive() {
                return Ok(client);
            }
            debug!(peer = %peer, "Dropping dead bridge link");
            self.forget(peer);
        }

        let client = Arc::new(
            TcpClient::connect(
                peer,
                &self.config,
                self.observers.clone(),
                Arc::clone(&self.metrics),
            )
            .await?,
        );
        info!(peer = %peer, "Bridge link opened");

        // Another sender may have connected meanwhile; keep the first link.
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(peers.entry(peer).or_insert(client)))
    }

    fn forget(&self, peer: SocketAddr) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&peer);
    }

    async fn send(&self, frame: &Frame, peer: SocketAddr) -> Result<()> {
        let client = self.link_to(peer).await?;
        let result = client.send_frame(frame.clone());
        if result.is_err() {
            self.forget(peer);
        }
        result
    }

    async fn shutdown(&self) {
        let links: Vec<_> = self
            .peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in links {
            client.close().await;
        }
        self.server.stop().await;
    }
}
