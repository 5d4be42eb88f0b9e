//! Two-node gossip convergence and the conflict-resolution rules.

use std::time::Duration;

use bifrost_lb_lib::cluster::{
    remote_wins, ClusterRuntime, StateStore, StateType, SyncableState,
};
use bifrost_lb_lib::config::ClusterConfig;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn cluster_config(node_id: &str, port: u16, seeds: Vec<String>) -> ClusterConfig {
    ClusterConfig {
        enabled: true,
        node_id: Some(node_id.to_string()),
        bind_address: "127.0.0.1".to_string(),
        bind_port: port,
        seeds,
        gossip_interval_ms: 50,
        gossip_fanout: 3,
        push_pull_interval_ms: 500,
        ping_interval_ms: 50,
        ping_timeout_ms: 200,
        ping_req_count: 2,
        suspicion_mult: 4,
    }
}

#[tokio::test]
async fn circuit_state_converges_across_nodes() {
    let port1 = free_port();
    let port2 = free_port();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    let node1 = ClusterRuntime::new(cluster_config("node-1", port1, Vec::new()), Vec::new(), None);
    let node2 = ClusterRuntime::new(
        cluster_config("node-2", port2, vec![format!("127.0.0.1:{port1}")]),
        Vec::new(),
        None,
    );
    node1.start(&tracker, &cancel).await.unwrap();
    node2.start(&tracker, &cancel).await.unwrap();

    // Seed pinging introduces the nodes to each other.
    wait_until(Duration::from_secs(5), || {
        node1.status().map(|s| s.nodes_alive >= 1).unwrap_or(false)
            && node2.status().map(|s| s.nodes_alive >= 1).unwrap_or(false)
    })
    .await;

    node1
        .publish(StateType::CircuitBreaker, "10.0.0.1:8080", json!({"phase": "open"}))
        .unwrap();

    // The dirty set travels on the next gossip round.
    wait_until(Duration::from_secs(5), || {
        node2
            .store()
            .get(StateType::CircuitBreaker, "10.0.0.1:8080")
            .map(|s| s.value["phase"] == "open")
            .unwrap_or(false)
    })
    .await;

    // Lamport clocks advanced past the received version.
    let received = node2.store().get(StateType::CircuitBreaker, "10.0.0.1:8080").unwrap();
    assert!(node2.clock().next_version() > received.version);

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn sync_now_forces_full_exchange() {
    let port1 = free_port();
    let port2 = free_port();
    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();

    let node1 = ClusterRuntime::new(cluster_config("node-1", port1, Vec::new()), Vec::new(), None);
    let node2 = ClusterRuntime::new(
        cluster_config("node-2", port2, vec![format!("127.0.0.1:{port1}")]),
        Vec::new(),
        None,
    );
    node1.start(&tracker, &cancel).await.unwrap();
    node2.start(&tracker, &cancel).await.unwrap();

    wait_until(Duration::from_secs(5), || {
        node1.status().map(|s| s.nodes_alive >= 1).unwrap_or(false)
    })
    .await;

    node1
        .publish(StateType::Health, "10.0.0.9:80", json!({"status": "unhealthy", "last_check_ns": 5}))
        .unwrap();
    // Swallow the dirty set so only push-pull can move the state.
    node1.store().take_dirty();

    let peers = node1.sync_now().await.unwrap();
    assert!(peers >= 1);
    wait_until(Duration::from_secs(5), || {
        node2.store().get(StateType::Health, "10.0.0.9:80").is_some()
    })
    .await;

    cancel.cancel();
    tracker.close();
    tracker.wait().await;
}

#[test]
fn severity_survives_a_newer_closed() {
    // Scenario: local CLOSED adopts a remote OPEN regardless of version;
    // a later CLOSED with a higher version still loses to OPEN severity.
    let store = StateStore::new();
    let local = SyncableState {
        state_type: StateType::CircuitBreaker,
        key: "10.0.0.1:8080".to_string(),
        value: json!({"phase": "closed"}),
        version: 10,
        source_node: "node-1".to_string(),
        timestamp_ns: 0,
    };
    store.local_update(local.clone()).unwrap();

    let remote_open = SyncableState {
        value: json!({"phase": "open"}),
        version: 2,
        source_node: "node-2".to_string(),
        ..local.clone()
    };
    assert!(remote_wins(&local, &remote_open));
    assert!(store.apply_remote(remote_open.clone()));

    let remote_closed_newer = SyncableState {
        value: json!({"phase": "closed"}),
        version: 50,
        source_node: "node-3".to_string(),
        ..local
    };
    assert!(!remote_wins(&remote_open, &remote_closed_newer));
    assert!(!store.apply_remote(remote_closed_newer));
    assert_eq!(
        store.get(StateType::CircuitBreaker, "10.0.0.1:8080").unwrap().value["phase"],
        "open"
    );
}

#[test]
fn drain_state_resists_version_pressure() {
    let draining = SyncableState {
        state_type: StateType::Drain,
        key: "10.0.0.1:8080".to_string(),
        value: json!({"draining": true}),
        version: 1,
        source_node: "node-1".to_string(),
        timestamp_ns: 0,
    };
    let not_draining_newer = SyncableState {
        value: json!({"draining": false}),
        version: 99,
        source_node: "node-2".to_string(),
        ..draining.clone()
    };
    assert!(!remote_wins(&draining, &not_draining_newer));
    assert!(remote_wins(&not_draining_newer, &draining));
}

async fn wait_until<F: Fn() -> bool>(budget: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within {budget:?}");
}
