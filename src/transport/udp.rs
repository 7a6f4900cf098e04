//! UDP link
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::debug;

use super::wire::MAX_PACKET;
use super::Link;
use crate::error::{FlockError, Result};

/// Statistics for the link
#[derive(Debug, Default)]
pub struct LinkStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub receive_errors: AtomicU64,
    pub send_errors: AtomicU64,
}

impl std::fmt::Display for LinkStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} received, {} sent, {} receive errors, {} send errors",
            self.messages_received.load(Ordering::Relaxed),
            self.messages_sent.load(Ordering::Relaxed),
            self.receive_errors.load(Ordering::Relaxed),
            self.send_errors.load(Ordering::Relaxed)
        )
    }
}

#[derive(Debug)]
pub struct UdpLink {
    socket: UdpSocket,
    local_addr: SocketAddr,
    closed: AtomicBool,
    close_notify: Notify,
    pub stats: LinkStats,
}

impl UdpLink {
    /// Bind to `addr`. Peers reach us at exactly this address, so it must be
    /// routable rather than a wildcard.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| FlockError::Transport(format!("Socket creation failed: {}", e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| FlockError::Transport(format!("Socket creation failed: {}", e)))?;

        Ok(Self {
            socket,
            local_addr,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            stats: LinkStats::default(),
        })
    }
}

#[async_trait]
impl Link for UdpLink {
    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn send_to(&self, dest: SocketAddr, pkt: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(pkt, dest).await.map_err(|e| {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            FlockError::Transport(format!("send to {} failed: {}", dest, e))
        })?;
        if sent != pkt.len() {
            self.stats.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(FlockError::Transport(format!(
                "pkt length error: sent {}, expected {}",
                sent,
                pkt.len()
            )));
        }
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.close_notify.notified() => return None,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, _)) => {
                        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                        return Some(buf[..len].to_vec());
                    }
                    Err(e) => {
                        self.stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("[{}] UDP receive error: {}", self.local_addr, e);
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.close_notify.notify_waiters();
    }
}
