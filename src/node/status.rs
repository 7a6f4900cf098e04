//! Flock stability analysis
//!
//! Folds the monitoring events of one or more nodes into [`Status`] reports. A
//! flock is called stable once its leader has reported the same membership for a
//! whole window with no reboots in flight.
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::messages::{MonInfo, MonOp, Status};

/// How long a stable report holds off the next one for the same flock
const REPORT_HOLDOFF_MINUTES: i64 = 100;

#[derive(Debug)]
pub enum AnalyserCommand {
    /// Forget every flock seen so far
    Reset,
    Quit,
}

#[derive(Debug)]
pub struct StatusAggregator {
    window: Duration,
    // flock name -> last membership report
    world: HashMap<String, MonInfo>,
    reboot: HashSet<String>,
    // signature under test
    candidate: Option<String>,
    tstart: DateTime<Utc>,
    tstable: DateTime<Utc>,
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl StatusAggregator {
    pub fn new(window: Duration) -> Self {
        let now = Utc::now();
        Self {
            window,
            world: HashMap::new(),
            reboot: HashSet::new(),
            candidate: None,
            tstart: now,
            tstable: now,
        }
    }

    pub fn reset(&mut self) {
        debug!("resetting flock status");
        self.world.clear();
    }

    /// Number of flocks currently tracked
    pub fn flocks(&self) -> usize {
        self.world.len()
    }

    pub fn observe(&mut self, mi: &MonInfo) -> Option<Status> {
        let mut report = None;
        match mi.op {
            MonOp::Join => {
                debug!("[{}] change flock {} -> {}", mi.moniker, mi.oflock, mi.flock);
            }
            MonOp::LeaderStart => {
                self.world.insert(mi.flock.clone(), mi.clone());
                self.reboot.remove(&mi.moniker);
                debug!("[{}] start new flock {} (old={})", mi.moniker, mi.flock, mi.oflock);
            }
            MonOp::LeaderHeart | MonOp::LeaderDelta => {
                let signature = mi.signature();
                let old = self.world.get(&mi.flock);
                if old.map(MonInfo::signature).as_deref() == Some(signature.as_str()) {
                    if self.candidate.as_deref() == Some(signature.as_str()) && mi.t > self.tstable {
                        report = Some(Status {
                            t: Utc::now(),
                            period: (mi.t - self.tstart).to_std().unwrap_or_default(),
                            stable: true,
                            name: signature,
                            n: mi.n + 1,
                        });
                        self.tstable = mi.t + chrono::Duration::minutes(REPORT_HOLDOFF_MINUTES);
                    }
                    // an unchanged flock keeps its entry
                    return report;
                }
                info!(
                    "flock {} membership change {} -> {}",
                    mi.flock,
                    old.map(|o| o.n + 1).unwrap_or(0),
                    mi.n + 1
                );
                self.world.insert(mi.flock.clone(), mi.clone());
                if mi.op == MonOp::LeaderHeart && self.reboot.is_empty() {
                    info!("starting stable test {}", signature);
                    self.candidate = Some(signature);
                    self.tstart = mi.t;
                    self.tstable = mi.t + chrono_duration(self.window);
                }
            }
            MonOp::Probe => {}
            MonOp::Reboot => {
                self.reboot.insert(mi.moniker.clone());
                debug!("[{}] rebooting ({} in flight)", mi.moniker, self.reboot.len());
            }
            MonOp::HeartBeat => match serde_json::to_string(mi) {
                Ok(json) => debug!("hb {}", json),
                Err(e) => debug!("hb not serializable: {}", e),
            },
            MonOp::Exit => {}
        }

        let cutoff = mi.t - chrono_duration(self.window.mul_f64(1.5));
        self.world.retain(|_, m| m.t >= cutoff);
        report
    }
}

/// The report sent when the analyser stops
pub fn final_status() -> Status {
    Status {
        t: Utc::now(),
        period: Duration::ZERO,
        stable: false,
        name: String::new(),
        n: 0,
    }
}

/// Analyse `events` until told to quit, an `Exit` event arrives, or every input
/// closes. A final zero-member status is always sent last.
pub async fn run_analyser(
    window: Duration,
    mut commands: mpsc::Receiver<AnalyserCommand>,
    mut events: mpsc::Receiver<MonInfo>,
    status: mpsc::Sender<Status>,
) {
    let mut aggregator = StatusAggregator::new(window);
    loop {
        tokio::select! {
            Some(cmd) = commands.recv() => match cmd {
                AnalyserCommand::Reset => aggregator.reset(),
                AnalyserCommand::Quit => break,
            },
            Some(mi) = events.recv() => {
                if mi.op == MonOp::Exit {
                    info!("[{}] got an exit", mi.moniker);
                    break;
                }
                if let Some(report) = aggregator.observe(&mi) {
                    if status.send(report).await.is_err() {
                        break;
                    }
                }
            }
            else => {
                info!("analyser inputs closed, exiting");
                break;
            }
        }
    }
    if status.send(final_status()).await.is_err() {
        debug!("nobody listening for final status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    fn at(t0: DateTime<Utc>, secs: i64, mi: MonInfo) -> MonInfo {
        mi.at(t0 + chrono::Duration::seconds(secs))
    }

    fn heart(t0: DateTime<Utc>, secs: i64, n: usize) -> MonInfo {
        at(t0, secs, MonInfo::new(MonOp::LeaderHeart, "alpha", "_f00").with_count(n))
    }

    #[test]
    fn test_stable_after_window() {
        let t0 = Utc::now();
        let mut agg = StatusAggregator::new(WINDOW);
        assert!(agg
            .observe(&at(t0, 0, MonInfo::new(MonOp::LeaderStart, "alpha", "_f00")))
            .is_none());
        assert!(agg.observe(&heart(t0, 1, 1)).is_none());
        assert!(agg.observe(&heart(t0, 5, 1)).is_none());

        let report = agg.observe(&heart(t0, 12, 1)).unwrap();
        assert!(report.stable);
        assert_eq!(report.n, 2);
        assert_eq!(report.period, Duration::from_secs(11));
        assert_eq!(report.name, heart(t0, 1, 1).signature());

        // no re-firing while nothing changes
        assert!(agg.observe(&heart(t0, 13, 1)).is_none());
        assert!(agg.observe(&heart(t0, 30, 1)).is_none());
    }

    #[test]
    fn test_membership_change_restarts_test() {
        let t0 = Utc::now();
        let mut agg = StatusAggregator::new(WINDOW);
        agg.observe(&heart(t0, 0, 1));
        agg.observe(&heart(t0, 8, 2));
        assert!(agg.observe(&heart(t0, 12, 2)).is_none());
        assert!(agg.observe(&heart(t0, 19, 2)).is_some());
    }

    #[test]
    fn test_reboot_in_flight_blocks_test() {
        let t0 = Utc::now();
        let mut agg = StatusAggregator::new(WINDOW);
        agg.observe(&at(t0, 0, MonInfo::new(MonOp::Reboot, "beta", "_f00")));
        agg.observe(&heart(t0, 1, 1));
        assert!(agg.observe(&heart(t0, 20, 1)).is_none());

        // the rebooted node is back; the next change starts a test
        agg.observe(&at(t0, 21, MonInfo::new(MonOp::LeaderStart, "beta", "_e00")));
        agg.observe(&heart(t0, 22, 2));
        assert!(agg.observe(&heart(t0, 33, 2)).is_some());
    }

    #[test]
    fn test_stale_flocks_pruned_and_reset() {
        let t0 = Utc::now();
        let mut agg = StatusAggregator::new(WINDOW);
        agg.observe(&at(t0, 0, MonInfo::new(MonOp::LeaderStart, "alpha", "_a00")));
        agg.observe(&at(t0, 1, MonInfo::new(MonOp::LeaderStart, "beta", "_b00")));
        assert_eq!(agg.flocks(), 2);
        agg.observe(&at(t0, 16, MonInfo::new(MonOp::Probe, "beta", "_b00")));
        assert_eq!(agg.flocks(), 1);
        agg.reset();
        assert_eq!(agg.flocks(), 0);
    }

    #[tokio::test]
    async fn test_run_analyser_reports_and_exits() {
        let (cmd_tx, cmd_rx) = mpsc::channel(4);
        let (ev_tx, ev_rx) = mpsc::channel(16);
        let (st_tx, mut st_rx) = mpsc::channel(4);
        let task = tokio::spawn(run_analyser(WINDOW, cmd_rx, ev_rx, st_tx));

        let t0 = Utc::now();
        ev_tx.send(heart(t0, 0, 3)).await.unwrap();
        ev_tx.send(heart(t0, 11, 3)).await.unwrap();
        let report = st_rx.recv().await.unwrap();
        assert!(report.stable);
        assert_eq!(report.n, 4);

        cmd_tx.send(AnalyserCommand::Reset).await.unwrap();
        ev_tx
            .send(MonInfo::new(MonOp::Exit, "alpha", "_f00"))
            .await
            .unwrap();
        let last = st_rx.recv().await.unwrap();
        assert_eq!(last.n, 0);
        assert!(!last.stable);
        task.await.unwrap();
    }
}
