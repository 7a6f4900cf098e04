//! Process context
//!
//! Everything a node shares with the rest of the process travels in an explicit
//! [`AppContext`]: the packet disposition counters and the optional monitoring
//! channel.
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::node::MonInfo;
use crate::transport::DispositionCounters;

#[derive(Clone, Debug, Default)]
pub struct AppContext {
    counters: Arc<DispositionCounters>,
    monitor: Option<mpsc::Sender<MonInfo>>,
}

impl AppContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_monitor(mut self, monitor: mpsc::Sender<MonInfo>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn counters(&self) -> Arc<DispositionCounters> {
        Arc::clone(&self.counters)
    }

    /// Hand a monitoring event to the monitor, if any, waiting for room in its
    /// queue.
    pub async fn monitor(&self, event: MonInfo) {
        if let Some(tx) = &self.monitor {
            if let Err(e) = tx.send(event).await {
                debug!("monitor gone, event dropped: {:?}", e.0.op);
            }
        }
    }
}
