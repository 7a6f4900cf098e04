//! Flock election state machine
//!
//! [`Election`] owns every piece of flock state and is driven by the control loop
//! in [`super::flock`]: one method per timer plus [`Election::receive`] for
//! inbound packets. It never touches the network. Packets to send, key changes
//! and monitoring events are pushed onto an [`Action`] list which the caller
//! carries out in order.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, info, warn};

use super::messages::{Cmd, Info, MonInfo, MonOp};
use super::node_id::{flock_name, NodeId};
use super::timing::Timing;
use crate::crypto::{Key, Nonce};

pub const VOTE_MAX: i32 = 100_000;
/// Heartbeats a simulated reboot takes
pub const REBOOT_HEARTS: f64 = 4.0;
/// Fraction of each probe round spent on nodes we have heard from before
pub const HIST_REWORK: f64 = 0.1;
pub const SHORT_LEADER: u32 = 2;
pub const SPEC_LEADER: u32 = 10;
/// A leader is stable after this many heartbeats
pub const STABLE_LEADER: u32 = 6;
pub const SECONDARY_RETIRE_BEATS: u32 = 2;
pub const HISTORY_FORGET_BEATS: u32 = 60;

/// Something the control loop must do on behalf of the election
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    Send(Info),
    SetKeys {
        epoch: Nonce,
        sec0: Key,
        sec1: Option<Key>,
    },
    Monitor(MonInfo),
}

/// Member snapshot taken on every checkpoint tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub me: String,
    pub members: Vec<NodeId>,
}

/// State readable and writable from outside the control loop
#[derive(Clone, Debug, Default)]
pub struct Shared {
    pub flock: String,
    pub node: String,
    pub leader: String,
    pub stable: bool,
    pub horde: String,
    pub steward: String,
    pub registry: String,
    pub registry_key: String,
    pub gateway: String,
    pub members: Vec<NodeId>,
    pub checkpoint: Checkpoint,
}

/// Lock the shared state. A poisoned lock still holds usable names.
pub fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug)]
struct Member {
    id: NodeId,
    expire: SystemTime,
}

pub struct Election {
    info: Info,
    epoch: Nonce,
    sec0: Key,
    sec1: Option<Key>,
    sec1_beats: u32,
    visitor: bool,
    members: HashMap<String, Member>,
    // moniker -> (node, last heard)
    history: HashMap<String, (NodeId, SystemTime)>,
    // when we last became leader
    promotion: Option<SystemTime>,
    leader_expire: SystemTime,
    rotate_primary: bool,
    timing: Arc<dyn Timing>,
    shared: Arc<Mutex<Shared>>,
}

impl std::fmt::Debug for Election {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Election")
            .field("flock", &self.info.flock)
            .field("me", &self.info.me.moniker)
            .field("leader", &self.info.leader.moniker)
            .field("vote", &self.info.vote)
            .field("lvote", &self.info.lvote)
            .field("members", &self.members.len())
            .finish()
    }
}

impl Election {
    /// A node with no flock yet; call [`Election::start_over`] before anything else.
    pub fn new(
        me: NodeId,
        sec0: Key,
        beacon: impl Into<String>,
        visitor: bool,
        timing: Arc<dyn Timing>,
        shared: Arc<Mutex<Shared>>,
    ) -> Self {
        let mut info = Info::new(me);
        info.beacon = beacon.into();
        Self {
            info,
            epoch: Nonce::default(),
            sec0,
            sec1: None,
            sec1_beats: 0,
            visitor,
            members: HashMap::new(),
            history: HashMap::new(),
            promotion: None,
            leader_expire: SystemTime::UNIX_EPOCH,
            rotate_primary: false,
            timing,
            shared,
        }
    }

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn is_leader(&self) -> bool {
        self.info.leader.is_same(&self.info.me)
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.members.values().map(|m| m.id.clone()).collect()
    }

    pub fn epoch(&self) -> Nonce {
        self.epoch
    }

    fn me(&self) -> &str {
        &self.info.me.moniker
    }

    fn hb(&self) -> Duration {
        self.timing.heartbeat()
    }

    fn draw_vote(&self) -> i32 {
        if self.visitor {
            1
        } else {
            rand::thread_rng().gen_range(1..VOTE_MAX)
        }
    }

    fn monitor(&self, op: MonOp, out: &mut Vec<Action>) {
        out.push(Action::Monitor(MonInfo::new(
            op,
            self.me(),
            self.info.flock.clone(),
        )));
    }

    /// Send ourselves to `dest`. Packets to ourselves are skipped.
    fn ping(&mut self, dest: NodeId, now: SystemTime, out: &mut Vec<Action>) {
        if dest.is_same(&self.info.me) {
            self.info.dest = dest;
            return;
        }
        self.info.dest = dest;
        self.info.expire = now + self.hb() * SHORT_LEADER;
        debug!("[{}] ping({}) using {}", self.me(), self.info.dest, self.epoch);
        out.push(Action::Send(self.info.clone()));
    }

    /// Ping every member, then forget them; they will find the new leader.
    fn hand_off_members(&mut self, now: SystemTime, out: &mut Vec<Action>) {
        let members: Vec<NodeId> = self.members.drain().map(|(_, m)| m.id).collect();
        for member in members {
            self.ping(member, now, out);
        }
        self.checkpoint();
    }

    fn push_keys(&self, out: &mut Vec<Action>) {
        debug!("[{}] setkey epoch {} sec0 {}", self.me(), self.epoch, self.sec0);
        out.push(Action::SetKeys {
            epoch: self.epoch,
            sec0: self.sec0,
            sec1: self.sec1,
        });
    }

    fn set_epoch(&mut self, epoch: Nonce, out: &mut Vec<Action>) {
        self.epoch = epoch;
        self.info.epoch_id = epoch;
        self.rotate_primary = false;
        self.push_keys(out);
    }

    fn set_svcs(&mut self) {
        let shared = lock_shared(&self.shared);
        self.info.steward = shared.steward.clone();
        self.info.registry = shared.registry.clone();
        self.info.registry_key = shared.registry_key.clone();
    }

    fn adopt_svcs(&mut self, probe: &Info) {
        self.info.steward = probe.steward.clone();
        self.info.registry = probe.registry.clone();
        self.info.registry_key = probe.registry_key.clone();
    }

    /// Publish the names external callers read
    pub fn publish(&self) {
        let mut shared = lock_shared(&self.shared);
        shared.flock = self.info.flock.clone();
        shared.node = self.info.me.moniker.clone();
        shared.leader = self.info.leader.moniker.clone();
        shared.stable = self.info.lvote == VOTE_MAX;
        shared.members = self.members();
    }

    pub fn checkpoint(&self) {
        debug!("[{}] checkpointing {} members", self.me(), self.members.len());
        let mut shared = lock_shared(&self.shared);
        shared.checkpoint = Checkpoint {
            me: self.info.me.moniker.clone(),
            members: self.members(),
        };
    }

    /// Abandon the current flock and lead a new one of our own.
    pub fn start_over(&mut self, now: SystemTime, out: &mut Vec<Action>) {
        let oflock = std::mem::replace(&mut self.info.flock, flock_name());
        self.info.vote = self.draw_vote();
        self.info.me.horde.clear();
        self.info.leader = self.info.me.clone();
        self.info.lvote = self.info.vote;
        self.info.expire = now + self.hb() * SHORT_LEADER;
        self.set_epoch(Nonce::random(), out);
        self.leader_expire = self.info.expire;
        self.history.clear();
        self.checkpoint();
        info!(
            "[{}] restart v={} flock={}",
            self.me(),
            self.info.vote,
            self.info.flock
        );
        let event = MonInfo::new(MonOp::LeaderStart, self.me(), self.info.flock.clone())
            .with_oflock(oflock)
            .with_count(self.members.len());
        out.push(Action::Monitor(event));
        self.promotion = Some(now);
        self.publish();
    }

    pub fn heartbeat(&mut self, now: SystemTime, out: &mut Vec<Action>) {
        if !self.members.is_empty() {
            let event = MonInfo::new(MonOp::LeaderHeart, self.me(), self.info.flock.clone())
                .with_count(self.members.len());
            out.push(Action::Monitor(event));
        }
        if self.leader_expire < now && !self.is_leader() {
            info!(
                "[{}] leader {} of flock {} expired",
                self.me(),
                self.info.leader,
                self.info.flock
            );
            let old = self.info.leader.clone();
            self.start_over(now, out);
            self.ping(old, now, out);
            return;
        }
        self.info.expire = now + self.hb() * SHORT_LEADER;
        self.retire_secondary(out);
        if !self.is_leader() {
            debug!("[{}] heartbeat to leader {}", self.me(), self.info.leader);
            self.set_svcs();
            let leader = self.info.leader.clone();
            self.ping(leader, now, out);
            self.promotion = None;
            self.publish();
            return;
        }

        match self.promotion {
            None => self.promotion = Some(now),
            Some(promotion) => {
                let celebration = promotion + self.hb() * STABLE_LEADER;
                if now > celebration && self.info.vote != VOTE_MAX {
                    self.info.vote = VOTE_MAX;
                    self.info.lvote = VOTE_MAX;
                    info!(
                        "[{}] flock {} promote vote to max {}",
                        self.me(),
                        self.info.flock,
                        VOTE_MAX
                    );
                }
            }
        }
        self.set_svcs();
        if !self.members.is_empty() {
            debug!(
                "[{}] heartbeat to {} members",
                self.me(),
                self.members.len()
            );
            self.leader_expire = self.info.expire + self.hb() * SHORT_LEADER;
            if self.rotate_primary {
                info!("[{}] rotating epoch key", self.me());
                self.set_epoch(Nonce::random(), out);
            }
            let members: Vec<NodeId> = self.members.values().map(|m| m.id.clone()).collect();
            for member in members {
                self.ping(member, now, out);
            }
        }
        self.publish();
    }

    /// The key period has run out; the next leader heartbeat with members draws a
    /// new epoch.
    pub fn key_period_elapsed(&mut self) {
        debug!("[{}] key timer", self.me());
        self.rotate_primary = true;
    }

    /// Probe round: a few nodes from history that are not members, the rest from
    /// the timing policy's probe source.
    pub fn makework(&mut self, now: SystemTime, out: &mut Vec<Action>) -> usize {
        let mut n = self.timing.probe_n();
        let mut nh = ((n as f64 * HIST_REWORK) as usize).max(1);
        if n <= 1 {
            n = 1;
            nh = 0;
        }

        let mut rng = rand::thread_rng();
        let mut slots: Vec<String> = Vec::with_capacity(n);
        let mut nvalid = 0;
        for (id, _) in self.history.values() {
            if self.members.contains_key(&id.moniker)
                || id.is_same(&self.info.leader)
                || id.is_same(&self.info.me)
            {
                continue;
            }
            nvalid += 1;
            if slots.len() < nh {
                slots.push(id.addr.clone());
            } else {
                let x = rng.gen_range(0..nvalid);
                if x < nh {
                    slots[x] = id.addr.clone();
                }
            }
        }

        let mut tries = 5 * n;
        while slots.len() < n && tries > 0 {
            tries -= 1;
            if let Some(addr) = self.timing.probe() {
                slots.push(addr);
            }
        }

        let event = MonInfo::new(MonOp::Probe, self.me(), self.info.flock.clone())
            .with_count(slots.len());
        out.push(Action::Monitor(event));
        let sent = slots.len();
        for addr in slots {
            self.ping(NodeId::from_addr(addr), now, out);
        }
        debug!("[{}] sent {} pings", self.me(), sent);
        sent
    }

    /// Drop expired members and stale history. Returns the number of members
    /// pruned.
    pub fn prune(&mut self, now: SystemTime, out: &mut Vec<Action>) -> usize {
        let before = self.members.len();
        if before > 0 {
            self.members.retain(|moniker, m| {
                let keep = m.expire >= now;
                if !keep {
                    debug!("pruning expired {}", moniker);
                }
                keep
            });
            let pruned = before - self.members.len();
            if pruned > 0 {
                let event = MonInfo::new(MonOp::LeaderDelta, self.me(), self.info.flock.clone())
                    .with_count(self.members.len());
                out.push(Action::Monitor(event));
                info!(
                    "[{}] flock {} pruned {} expired members",
                    self.me(),
                    self.info.flock,
                    pruned
                );
            }
            self.checkpoint();
        }

        let forget = self.hb() * HISTORY_FORGET_BEATS;
        self.history.retain(|_, (_, seen)| match now.duration_since(*seen) {
            Ok(age) => age <= forget,
            Err(_) => true,
        });
        self.publish();
        before - self.members.len()
    }

    /// Replace the secondary key. The old one stays acceptable for a couple of
    /// heartbeats.
    pub fn rotate_secondary(&mut self, key: Key, out: &mut Vec<Action>) {
        info!("[{}] rotating secondary key to {}", self.me(), key);
        self.sec1 = Some(self.sec0);
        self.sec0 = key;
        self.sec1_beats = SECONDARY_RETIRE_BEATS;
        self.push_keys(out);
    }

    fn retire_secondary(&mut self, out: &mut Vec<Action>) {
        if self.sec1.is_none() {
            return;
        }
        self.sec1_beats = self.sec1_beats.saturating_sub(1);
        if self.sec1_beats == 0 {
            debug!("[{}] retiring old secondary key", self.me());
            self.sec1 = None;
            self.push_keys(out);
        }
    }

    /// How long a reboot takes: four heartbeats, give or take a fifth.
    pub fn reboot_delay(&self) -> Duration {
        let jitter = 0.8 + 0.4 * rand::thread_rng().gen::<f64>();
        self.hb().mul_f64(jitter * REBOOT_HEARTS)
    }

    /// Apply one inbound packet. Returns a delay when the packet asks us to
    /// reboot; the caller waits that long and then calls
    /// [`Election::start_over`].
    pub fn receive(
        &mut self,
        probe: Info,
        now: SystemTime,
        out: &mut Vec<Action>,
    ) -> Option<Duration> {
        if probe.is_command() {
            return self.command(probe, now, out);
        }
        self.history
            .insert(probe.me.moniker.clone(), (probe.me.clone(), now));
        if probe.me.is_same(&self.info.me) {
            return None;
        }
        if probe.expire < now {
            debug!("[{}] probe from {} expired", self.me(), probe.me);
            return None;
        }
        debug!(
            "[{}] probe({}:{} ldr={} lv={} v={}) me({} ldr={} lv={} v={})",
            self.me(),
            probe.flock,
            probe.me,
            probe.leader,
            probe.lvote,
            probe.vote,
            self.info.flock,
            self.info.leader,
            self.info.lvote,
            self.info.vote
        );
        if !probe.dest.horde.is_empty() {
            debug!("[{}] setting horde to {}", self.me(), probe.dest.horde);
            lock_shared(&self.shared).horde = probe.dest.horde.clone();
        }
        self.info.expire = now + self.hb();

        match probe.flock.cmp(&self.info.flock) {
            std::cmp::Ordering::Greater => self.join(probe, now, out),
            std::cmp::Ordering::Less => self.ping(probe.me, now, out),
            std::cmp::Ordering::Equal => self.same_flock(probe, now, out),
        }
        self.publish();
        None
    }

    fn command(&mut self, probe: Info, now: SystemTime, out: &mut Vec<Action>) -> Option<Duration> {
        match Cmd::try_from(probe.lvote) {
            Ok(Cmd::Reboot) => {
                self.monitor(MonOp::Reboot, out);
                let delay = self.reboot_delay();
                info!("[{}] rebooting! duration={:?}", self.me(), delay);
                Some(delay)
            }
            Ok(Cmd::Candidate) => {
                debug!("[{}] candidate probe to {}", self.me(), probe.leader);
                self.ping(probe.leader, now, out);
                None
            }
            Err(code) => {
                debug!("[{}] unknown admin command {}", self.me(), code);
                None
            }
        }
    }

    /// The probe's flock sorts above ours: move over to it.
    fn join(&mut self, probe: Info, now: SystemTime, out: &mut Vec<Action>) {
        let old = self.info.leader.clone();
        info!(
            "[{}] joining flock {} led by {} (was {})",
            self.me(),
            probe.flock,
            probe.leader,
            self.info.flock
        );
        let event = MonInfo::new(MonOp::Join, self.me(), probe.flock.clone())
            .with_oflock(self.info.flock.clone())
            .with_count(self.members.len());
        out.push(Action::Monitor(event));
        self.info.flock = probe.flock.clone();

        // a promoted vote would outrank everyone in the new flock
        if self.info.vote == VOTE_MAX {
            self.info.vote = self.draw_vote();
            debug!("[{}] set new vote {}", self.me(), self.info.vote);
        }
        if probe.lvote >= self.info.vote || self.info.vote == VOTE_MAX {
            self.info.leader = probe.leader.clone();
            self.info.lvote = probe.lvote;
            self.adopt_svcs(&probe);
            self.promotion = None;
        } else {
            self.info.leader = self.info.me.clone();
            self.info.lvote = self.info.vote;
            self.promotion = Some(now);
        }
        self.set_epoch(probe.epoch_id, out);
        self.hand_off_members(now, out);
        self.ping(probe.leader, now, out);
        self.ping(old, now, out);
        self.leader_expire = now + self.hb() * SHORT_LEADER;
    }

    fn same_flock(&mut self, probe: Info, now: SystemTime, out: &mut Vec<Action>) {
        if probe.lvote == VOTE_MAX
            && self.info.lvote == VOTE_MAX
            && !probe.leader.is_same(&self.info.leader)
        {
            warn!(
                "[{}] flock {} has two leaders ({} and {}); starting over",
                self.me(),
                self.info.flock,
                self.info.leader,
                probe.leader
            );
            self.start_over(now, out);
            return;
        }

        if probe.vote > self.info.lvote {
            info!(
                "[{}] {} outvotes leader {} ({} > {})",
                self.me(),
                probe.me,
                self.info.leader,
                probe.vote,
                self.info.lvote
            );
            self.info.leader = probe.me.clone();
            self.info.lvote = probe.vote;
            self.adopt_svcs(&probe);
            self.ping(probe.me, now, out);
            self.leader_expire = self.info.expire + self.hb() * SPEC_LEADER;
            self.hand_off_members(now, out);
            return;
        }

        if probe.me.is_same(&self.info.leader) {
            self.leader_expire = self.info.expire + self.hb() * SHORT_LEADER;
            let beacon_changed = probe.beacon != self.info.beacon;
            if beacon_changed {
                self.info.beacon = probe.beacon.clone();
            }
            if probe.epoch_id != self.epoch || beacon_changed {
                self.set_epoch(probe.epoch_id, out);
            }
            self.adopt_svcs(&probe);
            self.info.lvote = probe.lvote;
            let mut shared = lock_shared(&self.shared);
            shared.steward = probe.steward.clone();
            shared.registry = probe.registry.clone();
            shared.registry_key = probe.registry_key.clone();
        }

        if probe.leader.is_same(&self.info.leader) && self.is_leader() {
            let expire = now + self.timing.node_prune();
            if !self.members.contains_key(&probe.me.moniker) {
                debug!("[{}] adding member {}", self.me(), probe.me);
            }
            self.members.insert(
                probe.me.moniker.clone(),
                Member {
                    id: probe.me,
                    expire,
                },
            );
            return;
        }

        if probe.lvote > self.info.lvote {
            info!(
                "[{}] following better leader {} ({} > {})",
                self.me(),
                probe.leader,
                probe.lvote,
                self.info.lvote
            );
            self.info.leader = probe.leader.clone();
            self.info.lvote = probe.lvote;
            self.adopt_svcs(&probe);
            self.ping(probe.leader, now, out);
            self.leader_expire = self.info.expire + self.hb() * SPEC_LEADER;
            self.hand_off_members(now, out);
            return;
        }

        if probe.lvote < self.info.lvote {
            debug!(
                "[{}] probe has bad leader ({} < {}); ping back",
                self.me(),
                probe.lvote,
                self.info.lvote
            );
            self.ping(probe.me, now, out);
        }
    }
}
