mod common;

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use common::{flock_ca, start_node, wait_until, TestNode};
use flock::context::AppContext;
use flock::node::{MonInfo, MonOp};
use flock::transport::{Disposition, MemoryNetwork};

const HB: Duration = Duration::from_millis(50);
const LIMIT: Duration = Duration::from_secs(10);

fn same_flock(nodes: &[&TestNode]) -> bool {
    let names: Vec<_> = nodes.iter().map(|n| n.flock.names()).collect();
    names
        .iter()
        .all(|n| !n.flock.is_empty() && n.flock == names[0].flock && n.leader == names[0].leader)
}

/// Collect monitor events in the background so the channel never fills.
fn recording_context() -> (AppContext, Arc<Mutex<Vec<MonOp>>>) {
    let (tx, mut rx) = mpsc::channel::<MonInfo>(64);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            sink.lock().unwrap().push(event.op);
        }
    });
    (AppContext::new().with_monitor(tx), seen)
}

async fn close_all(nodes: &[&TestNode]) {
    for node in nodes {
        timeout(Duration::from_secs(2), node.flock.close())
            .await
            .expect("close should complete");
    }
}

#[tokio::test]
async fn test_two_nodes_converge() {
    let net = MemoryNetwork::new();
    let ca = flock_ca();
    let a = start_node(&net, &ca, "10.0.0.1", &["10.0.0.2"], HB, AppContext::new());
    let b = start_node(&net, &ca, "10.0.0.2", &["10.0.0.1"], HB, AppContext::new());

    assert!(wait_until(LIMIT, || !a.flock.names().flock.is_empty() && !b.flock.names().flock.is_empty()).await);
    let first = a.flock.names().flock.max(b.flock.names().flock);

    assert!(wait_until(LIMIT, || same_flock(&[&a, &b])).await);
    let names = a.flock.names();
    assert_eq!(names.flock, first);

    let (leader, follower) = if names.leader == "10.0.0.1" { (&a, &b) } else { (&b, &a) };
    assert!(wait_until(LIMIT, || leader.flock.members().len() == 1).await);
    assert_eq!(leader.flock.members()[0].moniker, follower.flock.names().node);
    assert!(follower.flock.members().is_empty());

    // the handshake ran and data flowed both ways
    assert!(a.transport.counters().get(Disposition::Data) > 0);
    assert!(b.transport.counters().get(Disposition::Data) > 0);
    assert_eq!(a.transport.counters().get(Disposition::BadSignature), 0);

    close_all(&[&a, &b]).await;
}

#[tokio::test]
async fn test_three_nodes_converge_and_stabilise() {
    let net = MemoryNetwork::new();
    let ca = flock_ca();
    let a = start_node(&net, &ca, "10.0.0.1", &["10.0.0.2", "10.0.0.3"], HB, AppContext::new());
    let b = start_node(&net, &ca, "10.0.0.2", &["10.0.0.1", "10.0.0.3"], HB, AppContext::new());
    let c = start_node(&net, &ca, "10.0.0.3", &["10.0.0.1", "10.0.0.2"], HB, AppContext::new());

    assert!(wait_until(LIMIT, || same_flock(&[&a, &b, &c])).await);
    let leader = a.flock.names().leader;
    let leader_node = [&a, &b, &c]
        .into_iter()
        .find(|n| n.flock.names().node == leader)
        .unwrap();
    assert!(wait_until(LIMIT, || leader_node.flock.members().len() == 2).await);

    // a leader that keeps its job is promoted and reported stable everywhere
    assert!(wait_until(LIMIT, || [&a, &b, &c].iter().all(|n| n.flock.names().stable)).await);
    assert!(wait_until(LIMIT, || leader_node.flock.checkpoint().members.len() == 2).await);

    close_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_rebooted_node_rejoins() {
    let net = MemoryNetwork::new();
    let ca = flock_ca();
    let (ctx, events) = recording_context();
    let a = start_node(&net, &ca, "10.0.0.1", &["10.0.0.2"], HB, ctx);
    let b = start_node(&net, &ca, "10.0.0.2", &["10.0.0.1"], HB, AppContext::new());
    assert!(wait_until(LIMIT, || same_flock(&[&a, &b])).await);

    a.flock.reboot().await;
    assert!(wait_until(LIMIT, || events.lock().unwrap().contains(&MonOp::Reboot)).await);
    assert!(
        wait_until(LIMIT, || {
            let seen = events.lock().unwrap();
            let reboot = seen.iter().position(|op| *op == MonOp::Reboot);
            reboot.map_or(false, |at| seen[at..].contains(&MonOp::LeaderStart))
        })
        .await
    );
    assert!(wait_until(LIMIT, || same_flock(&[&a, &b])).await);

    close_all(&[&a, &b]).await;
}

#[tokio::test]
async fn test_lone_node_leads_itself() {
    let net = MemoryNetwork::new();
    let ca = flock_ca();
    let a = start_node(&net, &ca, "10.0.0.1", &["10.0.0.99"], HB, AppContext::new());

    assert!(wait_until(LIMIT, || a.flock.names().stable).await);
    let names = a.flock.names();
    assert_eq!(names.leader, "10.0.0.1");
    assert_eq!(names.node, "10.0.0.1");
    assert!(names.flock.starts_with('_'));
    assert!(a.flock.members().is_empty());

    close_all(&[&a]).await;
    // closing twice is harmless
    timeout(Duration::from_secs(1), a.flock.close()).await.unwrap();
}
