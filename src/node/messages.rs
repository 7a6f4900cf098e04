use std::time::{Duration, SystemTime};

use bincode::{Decode, Encode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::crypto::Nonce;

/// The gossip packet every node sends and receives.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Info {
    pub flock: String,
    pub dest: NodeId,
    pub me: NodeId,
    pub leader: NodeId,
    pub lvote: i32,
    // zero marks an admin command, whose code rides in lvote
    pub vote: i32,
    pub expire: SystemTime,
    pub epoch_id: Nonce,
    pub beacon: String,
    pub steward: String,
    pub registry: String,
    pub registry_key: String,
}

impl Info {
    pub fn new(me: NodeId) -> Self {
        Self {
            flock: String::new(),
            dest: NodeId::default(),
            leader: me.clone(),
            me,
            lvote: 0,
            vote: 0,
            expire: SystemTime::UNIX_EPOCH,
            epoch_id: Nonce::default(),
            beacon: String::new(),
            steward: String::new(),
            registry: String::new(),
            registry_key: String::new(),
        }
    }

    /// An admin command addressed to `dest`. `leader` is only read by
    /// [`Cmd::Candidate`].
    pub fn command(me: NodeId, dest: NodeId, cmd: Cmd, leader: NodeId) -> Self {
        Self {
            dest,
            leader,
            lvote: cmd as i32,
            vote: 0,
            expire: SystemTime::now() + Duration::from_secs(60),
            ..Self::new(me)
        }
    }

    pub fn is_command(&self) -> bool {
        self.vote == 0
    }
}

/// Admin commands carried in `lvote` when `vote == 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmd {
    Reboot = 0,
    Candidate = 1,
}

impl TryFrom<i32> for Cmd {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Cmd::Reboot),
            1 => Ok(Cmd::Candidate),
            other => Err(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonOp {
    Join,
    LeaderStart,
    LeaderHeart,
    LeaderDelta,
    Probe,
    Reboot,
    HeartBeat,
    Exit,
}

impl std::fmt::Display for MonOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MonOp::Join => "Join",
            MonOp::LeaderStart => "LeaderStart",
            MonOp::LeaderHeart => "LeaderHeart",
            MonOp::LeaderDelta => "LeaderDelta",
            MonOp::Probe => "Probe",
            MonOp::Reboot => "Reboot",
            MonOp::HeartBeat => "HeartBeat",
            MonOp::Exit => "Exit",
        };
        write!(f, "{}", name)
    }
}

/// A monitoring event emitted by the election engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonInfo {
    pub op: MonOp,
    pub moniker: String,
    pub t: DateTime<Utc>,
    pub flock: String,
    pub oflock: String,
    pub n: usize,
}

impl MonInfo {
    pub fn new(op: MonOp, moniker: impl Into<String>, flock: impl Into<String>) -> Self {
        Self {
            op,
            moniker: moniker.into(),
            t: Utc::now(),
            flock: flock.into(),
            oflock: String::new(),
            n: 0,
        }
    }

    pub fn with_oflock(mut self, oflock: impl Into<String>) -> Self {
        self.oflock = oflock.into();
        self
    }

    pub fn with_count(mut self, n: usize) -> Self {
        self.n = n;
        self
    }

    pub fn at(mut self, t: DateTime<Utc>) -> Self {
        self.t = t;
        self
    }

    /// What a leader reports about its flock; two equal signatures in a row mean
    /// nothing observable changed.
    pub fn signature(&self) -> String {
        format!(
            "{}: ldr={} n={} oflock={} op={}",
            self.flock,
            self.moniker,
            self.n + 1,
            self.oflock,
            self.op
        )
    }
}

/// A stability report produced by the status aggregator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub t: DateTime<Utc>,
    pub period: Duration,
    pub stable: bool,
    pub name: String,
    pub n: usize,
}
