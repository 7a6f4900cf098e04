//! Flock membership and leader election
//!
//! Nodes probe their network for peers, merge into the flock whose name sorts
//! highest, and elect the member with the highest vote as leader. A leader that
//! survives long enough is promoted to the maximum vote and keeps the job until it
//! goes away.
pub mod election;
pub mod flock;
pub mod messages;
pub mod node_id;
pub mod status;
pub mod timing;

pub use election::{Action, Checkpoint, Election, VOTE_MAX};
pub use flock::{Flock, FlockConfig, FlockNames};
pub use messages::{Cmd, Info, MonInfo, MonOp, Status};
pub use node_id::{flock_name, NodeId};
pub use status::{run_analyser, AnalyserCommand, StatusAggregator};
pub use timing::{ProbeTiming, Timing};
