//! Transport traits
//!
//! [`Link`] moves raw datagrams; [`Transport`] moves gossip packets and owns
//! whatever security sits between the two.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::crypto::{Key, Nonce};
use crate::error::Result;
use crate::node::{Info, NodeId};

/// Unreliable datagram delivery between `ip:port` addresses
#[async_trait]
pub trait Link: Send + Sync {
    /// The address peers use to reach this link
    fn local_addr(&self) -> SocketAddr;

    /// Send one datagram. Delivery is best effort.
    async fn send_to(&self, dest: SocketAddr, pkt: &[u8]) -> Result<()>;

    /// Wait for the next datagram; `None` once the link is closed.
    async fn recv(&self) -> Option<Vec<u8>>;

    /// Stop delivering datagrams
    fn close(&self) {}
}

/// Packet transport used by the election engine
#[async_trait]
pub trait Transport: Send + Sync {
    /// The next valid gossip packet; `None` once the transport is closed.
    async fn recv(&self) -> Option<Info>;

    /// Send `info` to `info.dest`. Failures are logged and dropped.
    async fn send(&self, info: &Info);

    /// Fill in the parts of our identity the transport knows (address, default
    /// moniker).
    fn set_me(&self, me: &mut NodeId);

    /// Install the flock epoch and secondary keys. A changed epoch retires every
    /// active session key.
    fn set_keys(&self, epoch: &Nonce, sec0: &Key, sec1: Option<&Key>);

    fn quit(&self);
}

/// Resolve `host` (an IP address or a DNS name) at `port`.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs
        .next()
        .ok_or_else(|| crate::transport_error!("no address for host {}", host))
}
