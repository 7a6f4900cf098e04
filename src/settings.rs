//! Flock application settings
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::crypto::Key;
use crate::error::Result;
use crate::node::{FlockConfig, NodeId, ProbeTiming};
use crate::transport::{Credentials, TrustStore};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT: u16 = 7946;
pub const DEFAULT_PORT: &str = "7946";
pub const DEFAULT_HEARTBEAT_MS: &str = "1000";
pub const DEFAULT_CIDR_BITS: &str = "28";
pub const DEFAULT_STABLE_SECS: &str = "30";

/// Depth of the queue between a node's receiver task and its control loop
pub const INBOUND_QUEUE_DEPTH: usize = 99;

pub const NODE_CERT_FILE: &str = "node.der";
pub const NODE_KEY_FILE: &str = "node.key";
pub const CA_CERT_FILE: &str = "ca.der";
pub const INTERMEDIATE_CERT_FILE: &str = "intermediate.der";

#[derive(Clone, Debug)]
pub struct Settings {
    // Listen address; peers reach us here so it must be routable
    pub listen_address: String,

    // UDP port shared by every node of the flock
    pub listen_port: u16,

    // Node moniker (defaults to the listen address)
    pub node_name: Option<String>,

    // Administrative horde label
    pub horde: String,

    // External rendezvous address
    pub beacon: String,

    // Initial secondary key, hex encoded
    pub secondary_key: String,

    // Comma separated CIDR networks to probe
    pub networks: Option<String>,

    // File of addresses to probe, with an optional `nil <p>` miss line
    pub address_list: Option<PathBuf>,

    // Prefix length of our own subnet when no networks or list are given
    pub cidr_bits: u8,

    // Directory holding node.der, node.key, ca.der and optionally intermediate.der
    pub cert_dir: PathBuf,

    // Visitors always vote 1
    pub visitor: bool,

    // Timing Configuration
    pub heartbeat_ms: u64,     // Heartbeat period (default: 1000)
    pub stable_window_secs: u64, // Unchanged flock time before reporting stable (default: 30)
}

impl Settings {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn stable_window(&self) -> Duration {
        Duration::from_secs(self.stable_window_secs)
    }

    pub fn listen_socket(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_address
            .parse()
            .map_err(|e| crate::config_error!("invalid listen address {}: {}", self.listen_address, e))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }

    pub fn secondary(&self) -> Result<Key> {
        let key = Key::from_hex(&self.secondary_key)?;
        if key.is_zero() {
            return Err(crate::config_error!("secondary key must not be empty"));
        }
        Ok(key)
    }

    pub fn node_id(&self) -> NodeId {
        let id = match &self.node_name {
            Some(name) => NodeId::new(name.clone(), String::new()),
            None => NodeId::default(),
        };
        id.with_horde(self.horde.clone())
    }

    pub fn flock_config(&self) -> Result<FlockConfig> {
        Ok(FlockConfig {
            secondary: self.secondary()?,
            beacon: self.beacon.clone(),
            visitor: self.visitor,
        })
    }

    /// Load our certificate, PKCS#8 key and trust roots from the certificate
    /// directory.
    pub fn credentials(&self) -> Result<Credentials> {
        let read = |name: &str| {
            let path = self.cert_dir.join(name);
            std::fs::read(&path)
                .map_err(|e| crate::config_error!("can't read {}: {}", path.display(), e))
        };
        let cert = read(NODE_CERT_FILE)?;
        let key = read(NODE_KEY_FILE)?;
        let mut trust = TrustStore::new(vec![read(CA_CERT_FILE)?]);
        if self.cert_dir.join(INTERMEDIATE_CERT_FILE).exists() {
            trust = trust.with_intermediates(vec![read(INTERMEDIATE_CERT_FILE)?]);
        }
        Credentials::from_pkcs8(cert, &key, trust)
    }

    /// The probe policy: explicit networks first, then an address list, else our
    /// own subnet.
    pub fn probe_timing(&self) -> Result<ProbeTiming> {
        let own_ip = match self.listen_socket()?.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        if let Some(networks) = &self.networks {
            return ProbeTiming::networks(self.heartbeat(), networks, own_ip);
        }
        if let Some(path) = &self.address_list {
            let text = std::fs::read_to_string(path)?;
            return ProbeTiming::address_list(self.heartbeat(), &text);
        }
        Ok(ProbeTiming::subnet(self.heartbeat(), own_ip, self.cidr_bits))
    }
}
