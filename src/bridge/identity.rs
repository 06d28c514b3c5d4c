//! Bridge node identity.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use crate::config::BridgeConfig;
use crate::error::{ProtocolError, Result};

/// Where a node listens, how peers address it, and whom it accepts.
///
/// The public endpoint is always a member of the allowed set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeNodeIdentity {
    listen_endpoint: SocketAddr,
    public_endpoint: SocketAddr,
    /// The public endpoint was given explicitly rather than derived from the listen endpoint
    public_explicit: bool,
    allowed_peers: BTreeSet<SocketAddr>,
}

impl BridgeNodeIdentity {
    pub fn new(
        listen_endpoint: SocketAddr,
        public_endpoint: Option<SocketAddr>,
        allowed_peers: impl IntoIterator<Item = SocketAddr>,
    ) -> Self {
        let public_explicit = public_endpoint.is_some();
        let public_endpoint = public_endpoint.unwrap_or(listen_endpoint);
        let mut allowed_peers: BTreeSet<_> = allowed_peers.into_iter().collect();
        allowed_peers.insert(public_endpoint);

        Self {
            listen_endpoint,
            public_endpoint,
            public_explicit,
            allowed_peers,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let parse = |what: &str, value: &str| {
            value.parse::<SocketAddr>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid bridge {what} endpoint: '{value}'"))
            })
        };

        let listen = parse("listen", &config.listen_endpoint)?;
        let public = config
            .public_endpoint
            .as_deref()
            .map(|value| parse("public", value))
            .transpose()?;
        let allowed = config
            .allowed_peer_endpoints
            .iter()
            .map(|value| parse("peer", value))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(listen, public, allowed))
    }

    pub fn listen_endpoint(&self) -> SocketAddr {
        self.listen_endpoint
    }

    pub fn public_endpoint(&self) -> SocketAddr {
        self.public_endpoint
    }

    pub fn allowed_peers(&self) -> &BTreeSet<SocketAddr> {
        &self.allowed_peers
    }

    pub fn is_allowed(&self, peer: &SocketAddr) -> bool {
        self.allowed_peers.contains(peer)
    }

    pub fn allow(&mut self, peer: SocketAddr) {
        self.allowed_peers.insert(peer);
    }

    /// Record the address the transport actually bound (port 0 resolves
    /// here). A derived public endpoint follows it.
    pub fn bound_to(&mut self, local: SocketAddr) {
        if !self.public_explicit && self.public_endpoint != local {
            self.allowed_peers.remove(&self.public_endpoint);
            self.public_endpoint = local;
            self.allowed_peers.insert(local);
        }
        self.listen_endpoint = local;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_public_endpoint_always_allowed() {
        let identity = BridgeNodeIdentity::new(
            addr("0.0.0.0:9100"),
            Some(addr("10.0.0.5:9100")),
            [addr("10.0.0.6:9100")],
        );
        assert!(identity.is_allowed(&addr("10.0.0.5:9100")));
        assert!(identity.is_allowed(&addr("10.0.0.6:9100")));
        assert!(!identity.is_allowed(&addr("10.0.0.7:9100")));
    }

    #[test]
    fn test_derived_public_endpoint_follows_bind() {
        let mut identity = BridgeNodeIdentity::new(addr("127.0.0.1:0"), None, []);
        identity.bound_to(addr("127.0.0.1:40123"));

        assert_eq!(identity.public_endpoint(), addr("127.0.0.1:40123"));
        assert!(identity.is_allowed(&addr("127.0.0.1:40123")));
        assert!(!identity.is_allowed(&addr("127.0.0.1:0")));
    }

    #[test]
    fn test_from_config_rejects_bad_peer() {
        let config = BridgeConfig {
            allowed_peer_endpoints: vec!["not-an-endpoint".into()],
            ..BridgeConfig::default()
        };
        assert!(matches!(
            BridgeNodeIdentity::from_config(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
