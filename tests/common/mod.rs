//! Fixtures shared by the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flock::context::AppContext;
use flock::crypto::Key;
use flock::node::{Flock, FlockConfig, NodeId};
use flock::test_support::{CertAuthority, TestTiming};
use flock::transport::{MemoryLink, MemoryNetwork, SecureTransport};

pub const PORT: u16 = 7946;

/// An authority issuing certificates in the `flock` unit
pub fn flock_ca() -> CertAuthority {
    CertAuthority::new(&["flock"])
}

pub struct TestNode {
    pub flock: Flock,
    pub transport: Arc<SecureTransport<MemoryLink>>,
}

/// Start a node at `ip` on `net` that probes every address in `peers`.
pub fn start_node(
    net: &MemoryNetwork,
    ca: &CertAuthority,
    ip: &str,
    peers: &[&str],
    heartbeat: Duration,
    ctx: AppContext,
) -> TestNode {
    let link = net.attach(format!("{}:{}", ip, PORT).parse().unwrap());
    let transport = Arc::new(SecureTransport::new(
        link,
        "",
        Some(ca.credentials(ip)),
        &ctx,
    ));
    let timing = TestTiming::new(heartbeat, peers.iter().map(|p| p.to_string()).collect());
    let flock = Flock::start(
        NodeId::default(),
        transport.clone(),
        Arc::new(timing),
        FlockConfig {
            secondary: Key::from_hex("5ec0dd").unwrap(),
            beacon: String::new(),
            visitor: false,
        },
        ctx,
    )
    .unwrap();
    TestNode { flock, transport }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
