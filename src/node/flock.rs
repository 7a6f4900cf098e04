//! Flock node runtime
//!
//! A [`Flock`] runs two tasks: a receiver that forwards packets from the
//! transport into a bounded queue, and the control loop that owns the
//! [`Election`] and services its timers. Callers talk to the running node
//! through the handle's accessors, which only touch [`Shared`].
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::election::{lock_shared, Action, Checkpoint, Election, Shared};
use super::messages::{Cmd, Info};
use super::node_id::NodeId;
use super::timing::Timing;
use crate::concurrency_error;
use crate::context::AppContext;
use crate::crypto::Key;
use crate::error::Result;
use crate::settings::INBOUND_QUEUE_DEPTH;
use crate::transport::Transport;

// receiver + control loop
const TASKS: usize = 2;

/// What a node needs besides its identity, transport and timing
#[derive(Clone, Debug)]
pub struct FlockConfig {
    pub secondary: Key,
    pub beacon: String,
    pub visitor: bool,
}

/// Everything a node currently knows about itself and its flock
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlockNames {
    pub flock: String,
    pub horde: String,
    pub node: String,
    pub leader: String,
    pub stable: bool,
    pub steward: String,
    pub registry: String,
    pub registry_key: String,
    pub gateway: String,
}

#[derive(Debug)]
enum FlockCommand {
    RotateSecondary(Key),
}

pub struct Flock {
    me: NodeId,
    transport: Arc<dyn Transport>,
    shared: Arc<Mutex<Shared>>,
    commands: mpsc::Sender<FlockCommand>,
    shutdown: watch::Sender<bool>,
    finished: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl std::fmt::Debug for Flock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flock")
            .field("me", &self.me.moniker)
            .field("names", &self.names())
            .finish()
    }
}

impl Flock {
    /// Start a node. The transport fills in our address (and moniker, if empty)
    /// before the first flock is created.
    pub fn start(
        mut me: NodeId,
        transport: Arc<dyn Transport>,
        timing: Arc<dyn Timing>,
        config: FlockConfig,
        ctx: AppContext,
    ) -> Result<Self> {
        transport.set_me(&mut me);
        let shared = Arc::new(Mutex::new(Shared {
            node: me.moniker.clone(),
            horde: me.horde.clone(),
            steward: format!("{}:0", me.moniker),
            registry: format!("{}:0", me.moniker),
            registry_key: config.secondary.to_hex()?,
            ..Shared::default()
        }));
        info!("[{}] starting flock node at {}", me.moniker, me.addr);

        let election = Election::new(
            me.clone(),
            config.secondary,
            config.beacon,
            config.visitor,
            timing.clone(),
            shared.clone(),
        );
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (command_tx, command_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = mpsc::channel(TASKS);

        tokio::spawn(receiver(
            me.moniker.clone(),
            transport.clone(),
            inbound_tx,
            shutdown_rx.clone(),
            finished_tx.clone(),
        ));
        let control = ControlLoop {
            moniker: me.moniker.clone(),
            election,
            transport: transport.clone(),
            timing,
            ctx,
            closing: shutdown_rx.clone(),
        };
        tokio::spawn(control.run(inbound_rx, command_rx, shutdown_rx, finished_tx));

        Ok(Self {
            me,
            transport,
            shared,
            commands: command_tx,
            shutdown: shutdown_tx,
            finished: tokio::sync::Mutex::new(finished_rx),
        })
    }

    pub fn me(&self) -> &NodeId {
        &self.me
    }

    pub fn names(&self) -> FlockNames {
        let shared = lock_shared(&self.shared);
        FlockNames {
            flock: shared.flock.clone(),
            horde: shared.horde.clone(),
            node: shared.node.clone(),
            leader: shared.leader.clone(),
            stable: shared.stable,
            steward: shared.steward.clone(),
            registry: shared.registry.clone(),
            registry_key: shared.registry_key.clone(),
            gateway: shared.gateway.clone(),
        }
    }

    /// Current members; empty unless we lead a flock with followers.
    pub fn members(&self) -> Vec<NodeId> {
        lock_shared(&self.shared).members.clone()
    }

    /// The last member snapshot
    pub fn checkpoint(&self) -> Checkpoint {
        lock_shared(&self.shared).checkpoint.clone()
    }

    pub fn set_steward(&self, ip: &str, port: u16) {
        lock_shared(&self.shared).steward = format!("{}:{}", ip, port);
    }

    pub fn set_registry(&self, ip: &str, port: u16, key: &str) {
        let mut shared = lock_shared(&self.shared);
        shared.registry = format!("{}:{}", ip, port);
        shared.registry_key = key.to_string();
    }

    pub fn set_gateway(&self, ip: &str, port: u16) {
        lock_shared(&self.shared).gateway = format!("{}:{}", ip, port);
    }

    pub fn set_horde(&self, horde: &str) {
        lock_shared(&self.shared).horde = horde.to_string();
    }

    /// Ask ourselves to reboot: go quiet for a few heartbeats, then start a new
    /// flock.
    pub async fn reboot(&self) {
        info!("[{}] reboot", self.me.moniker);
        let cmd = Info::command(self.me.clone(), self.me.clone(), Cmd::Reboot, self.me.clone());
        self.transport.send(&cmd).await;
    }

    /// Ask ourselves to probe `leader` right away.
    pub async fn candidate(&self, leader: NodeId) {
        debug!("[{}] candidate {}", self.me.moniker, leader);
        let cmd = Info::command(self.me.clone(), self.me.clone(), Cmd::Candidate, leader);
        self.transport.send(&cmd).await;
    }

    /// Switch to a new secondary key; the old one is honoured for a short while.
    pub async fn rotate_secondary(&self, key: Key) -> Result<()> {
        if key.is_zero() {
            return Err(crate::config_error!("secondary key must not be empty"));
        }
        self.commands
            .send(FlockCommand::RotateSecondary(key))
            .await
            .map_err(|e| concurrency_error!("flock control loop gone: {}", e))
    }

    /// Stop both tasks and wait for them to finish.
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let mut finished = self.finished.lock().await;
        for _ in 0..TASKS {
            if finished.recv().await.is_none() {
                break;
            }
        }
        info!("[{}] flock node closed", self.me.moniker);
    }
}

async fn receiver(
    moniker: String,
    transport: Arc<dyn Transport>,
    inbound: mpsc::Sender<Info>,
    mut shutdown: watch::Receiver<bool>,
    finished: mpsc::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = transport.recv() => {
                let Some(info) = received else {
                    debug!("[{}] transport closed", moniker);
                    break;
                };
                tokio::select! {
                    _ = shutdown.changed() => break,
                    sent = inbound.send(info) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!("[{}] receiver quitting", moniker);
    if finished.send(()).await.is_err() {
        debug!("[{}] nobody waiting for receiver", moniker);
    }
}

struct ControlLoop {
    moniker: String,
    election: Election,
    transport: Arc<dyn Transport>,
    timing: Arc<dyn Timing>,
    ctx: AppContext,
    closing: watch::Receiver<bool>,
}

impl ControlLoop {
    /// Carry out the election's actions. Returns true if the keys changed.
    async fn apply(&self, out: &mut Vec<Action>) -> bool {
        let mut rekeyed = false;
        for action in out.drain(..) {
            match action {
                Action::Send(info) => self.transport.send(&info).await,
                Action::SetKeys { epoch, sec0, sec1 } => {
                    self.transport.set_keys(&epoch, &sec0, sec1.as_ref());
                    rekeyed = true;
                }
                Action::Monitor(event) => {
                    // a full monitor queue holds us up, but never past close()
                    let mut closing = self.closing.clone();
                    tokio::select! {
                        _ = self.ctx.monitor(event) => {}
                        _ = closing.wait_for(|closed| *closed) => {
                            debug!("[{}] closing, monitor event dropped", self.moniker);
                        }
                    }
                }
            }
        }
        rekeyed
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Info>,
        mut commands: mpsc::Receiver<FlockCommand>,
        mut shutdown: watch::Receiver<bool>,
        finished: mpsc::Sender<()>,
    ) {
        let timing = self.timing.clone();
        let mut out = Vec::new();
        self.election.start_over(SystemTime::now(), &mut out);
        self.apply(&mut out).await;

        let heartbeat = sleep(timing.heartbeat());
        let key_rotation = sleep(timing.key_period());
        let makework = sleep(timing.probebeat());
        let checkpoint = sleep(timing.checkpoint());
        let prune = sleep(timing.history_prune());
        tokio::pin!(heartbeat, key_rotation, makework, checkpoint, prune);

        info!(
            "[{}] control loop running with {:?} heartbeat",
            self.moniker,
            timing.heartbeat()
        );
        loop {
            tokio::select! {
                _ = &mut key_rotation => {
                    key_rotation.as_mut().reset(Instant::now() + timing.key_period());
                    self.election.key_period_elapsed();
                }
                _ = &mut heartbeat => {
                    heartbeat.as_mut().reset(Instant::now() + timing.heartbeat());
                    self.election.heartbeat(SystemTime::now(), &mut out);
                }
                _ = &mut makework => {
                    makework.as_mut().reset(Instant::now() + timing.probebeat());
                    self.election.makework(SystemTime::now(), &mut out);
                }
                _ = &mut checkpoint => {
                    checkpoint.as_mut().reset(Instant::now() + timing.checkpoint());
                    self.election.checkpoint();
                }
                _ = &mut prune => {
                    prune.as_mut().reset(Instant::now() + timing.history_prune());
                    self.election.prune(SystemTime::now(), &mut out);
                }
                Some(probe) = inbound.recv() => {
                    if let Some(delay) = self.election.receive(probe, SystemTime::now(), &mut out) {
                        self.apply(&mut out).await;
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = shutdown.changed() => break,
                        }
                        self.election.start_over(SystemTime::now(), &mut out);
                    }
                }
                Some(cmd) = commands.recv() => match cmd {
                    FlockCommand::RotateSecondary(key) => self.election.rotate_secondary(key, &mut out),
                },
                _ = shutdown.changed() => break,
            }
            if self.apply(&mut out).await {
                key_rotation
                    .as_mut()
                    .reset(Instant::now() + timing.key_period());
            }
        }

        self.election.checkpoint();
        info!("[{}] control loop quitting", self.moniker);
        if finished.send(()).await.is_err() {
            debug!("[{}] nobody waiting for control loop", self.moniker);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::crypto::Nonce;
    use crate::node::MonOp;
    use crate::test_support::TestTiming;

    /// Records what the node sends and never receives anything.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Info>>,
        keys: Mutex<Vec<Nonce>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn recv(&self) -> Option<Info> {
            std::future::pending().await
        }

        async fn send(&self, info: &Info) {
            self.sent.lock().unwrap().push(info.clone());
        }

        fn set_me(&self, me: &mut NodeId) {
            if me.moniker.is_empty() {
                me.moniker = "10.0.0.1".to_string();
            }
            me.addr = "10.0.0.1".to_string();
        }

        fn set_keys(&self, epoch: &Nonce, _sec0: &Key, _sec1: Option<&Key>) {
            self.keys.lock().unwrap().push(*epoch);
        }

        fn quit(&self) {}
    }

    fn config() -> FlockConfig {
        FlockConfig {
            secondary: Key::from_hex("c0ffee").unwrap(),
            beacon: String::new(),
            visitor: false,
        }
    }

    #[tokio::test]
    async fn test_start_publishes_names() {
        let transport = Arc::new(RecordingTransport::default());
        let (tx, mut rx) = mpsc::channel(16);
        let flock = Flock::start(
            NodeId::default(),
            transport.clone(),
            Arc::new(TestTiming::new(Duration::from_millis(50), Vec::new())),
            config(),
            AppContext::new().with_monitor(tx),
        )
        .unwrap();

        let start = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(start.op, MonOp::LeaderStart);

        let names = flock.names();
        assert_eq!(names.node, "10.0.0.1");
        assert_eq!(names.leader, "10.0.0.1");
        assert_eq!(names.flock, start.flock);
        assert_eq!(names.steward, "10.0.0.1:0");
        assert!(names.registry_key.ends_with("c0ffee"));
        assert!(!transport.keys.lock().unwrap().is_empty());

        flock.set_steward("10.0.0.1", 9000);
        flock.set_gateway("10.0.0.1", 9001);
        flock.set_horde("builders");
        let names = flock.names();
        assert_eq!(names.steward, "10.0.0.1:9000");
        assert_eq!(names.gateway, "10.0.0.1:9001");
        assert_eq!(names.horde, "builders");

        tokio::time::timeout(Duration::from_secs(2), flock.close())
            .await
            .unwrap();
        assert_eq!(flock.checkpoint().me, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_slow_monitor_loses_no_events() {
        let transport = Arc::new(RecordingTransport::default());
        let (tx, mut rx) = mpsc::channel(1);
        let flock = Flock::start(
            NodeId::new("a", ""),
            transport.clone(),
            Arc::new(TestTiming::new(
                Duration::from_millis(20),
                vec!["10.0.0.2".to_string()],
            )),
            config(),
            AppContext::new().with_monitor(tx),
        )
        .unwrap();

        // LeaderStart fills the queue; the first probe round waits behind it
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(transport.sent.lock().unwrap().is_empty());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.op, MonOp::LeaderStart);
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.op, MonOp::Probe);
            assert_eq!(event.flock, first.flock);
        }
        assert!(!transport.sent.lock().unwrap().is_empty());

        // close() is not held up by the undrained queue
        tokio::time::timeout(Duration::from_secs(2), flock.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_secondary_rejected() {
        let result = Flock::start(
            NodeId::default(),
            Arc::new(RecordingTransport::default()),
            Arc::new(TestTiming::new(Duration::from_millis(50), Vec::new())),
            FlockConfig {
                secondary: Key::default(),
                beacon: String::new(),
                visitor: false,
            },
            AppContext::new(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_probes_are_sent() {
        let transport = Arc::new(RecordingTransport::default());
        let flock = Flock::start(
            NodeId::new("a", ""),
            transport.clone(),
            Arc::new(TestTiming::new(
                Duration::from_millis(20),
                vec!["10.0.0.2".to_string()],
            )),
            config(),
            AppContext::new(),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        flock.close().await;
        let sent = transport.sent.lock().unwrap();
        assert!(sent.iter().any(|i| i.dest.addr == "10.0.0.2"));
        assert!(sent.iter().all(|i| i.me.moniker == "a"));
    }

    #[tokio::test]
    async fn test_rotate_secondary_rekeys() {
        let transport = Arc::new(RecordingTransport::default());
        let flock = Flock::start(
            NodeId::new("a", ""),
            transport.clone(),
            Arc::new(TestTiming::new(Duration::from_secs(5), Vec::new())),
            config(),
            AppContext::new(),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = transport.keys.lock().unwrap().len();

        flock.rotate_secondary(Key::random()).await.unwrap();
        assert!(flock.rotate_secondary(Key::default()).await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transport.keys.lock().unwrap().len(), before + 1);
        flock.close().await;
    }
}
