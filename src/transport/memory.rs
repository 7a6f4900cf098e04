//! In-process datagram network
//!
//! Links attached to the same [`MemoryNetwork`] exchange packets through bounded
//! queues. Packets to unknown addresses or full queues are dropped, as UDP would.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::Link;
use crate::error::Result;
use crate::settings::INBOUND_QUEUE_DEPTH;

#[derive(Clone, Debug, Default)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a link at `addr`, replacing any link already there.
    pub fn attach(&self, addr: SocketAddr) -> MemoryLink {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.insert(addr, tx);
        }
        MemoryLink {
            addr,
            network: self.clone(),
            inbox: tokio::sync::Mutex::new(rx),
        }
    }

    /// Remove `addr` from the network; packets to it are dropped from now on.
    pub fn detach(&self, addr: &SocketAddr) {
        if let Ok(mut inboxes) = self.inboxes.lock() {
            inboxes.remove(addr);
        }
    }

    fn deliver(&self, dest: &SocketAddr, pkt: &[u8]) -> bool {
        let inbox = match self.inboxes.lock() {
            Ok(inboxes) => inboxes.get(dest).cloned(),
            Err(_) => None,
        };
        match inbox {
            Some(tx) => tx.try_send(pkt.to_vec()).is_ok(),
            None => false,
        }
    }
}

#[derive(Debug)]
pub struct MemoryLink {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbox: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Link for MemoryLink {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_to(&self, dest: SocketAddr, pkt: &[u8]) -> Result<()> {
        if !self.network.deliver(&dest, pkt) {
            debug!("[{}] dropped packet to {}", self.addr, dest);
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.inbox.lock().await.recv().await
    }

    fn close(&self) {
        self.network.detach(&self.addr);
    }
}
