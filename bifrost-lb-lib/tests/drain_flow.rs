//! Drain lifecycle through the control plane, with the conntrack map
//! played by the kernel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bifrost_lb_lib::codec::{ip_to_bytes, ConnState, ConntrackKey, ConntrackValue};
use bifrost_lb_lib::config::load_from_str;
use bifrost_lb_lib::drain::DrainOutcome;
use bifrost_lb_lib::maps::RouteKey;
use bifrost_lb_lib::runtime::StaticInterfaceResolver;
use bifrost_lb_lib::{ControlPlane, MapSet};
use tokio::sync::mpsc;

const CONFIG: &str = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = [
  { ip = "10.1.1.1", port = 8080, weight = 50 },
  { ip = "10.1.1.2", port = 8080, weight = 50 },
]

[settings]
drain_check_interval_ms = 100
"#;

fn put_conn(maps: &MapSet, src_port: u16, nat_ip: &str) {
    let key = ConntrackKey {
        src_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
        dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
        src_port,
        dst_port: 443,
        protocol: 6,
    };
    let value = ConntrackValue {
        orig_dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
        nat_dst_ip: ip_to_bytes(nat_ip.parse().unwrap()),
        orig_dst_port: 443,
        nat_dst_port: 8080,
        last_seen_ns: 0,
        packets_fwd: 0,
        packets_rev: 0,
        bytes_fwd: 0,
        bytes_rev: 0,
        conn_state: ConnState::Established,
        proxy_flags: 0,
        seq_offset: 0,
        orig_client_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
        orig_client_port: src_port,
        created_ns: 0,
    };
    maps.conntrack.insert(key.encode(), value.encode()).unwrap();
}

fn clear_conns(maps: &MapSet) {
    for (k, _) in maps.conntrack.iterate() {
        maps.conntrack.delete(&k).unwrap();
    }
}

#[tokio::test]
async fn drain_completes_when_connections_release() {
    let maps = MapSet::in_memory();
    put_conn(&maps, 1000, "10.1.1.1");
    put_conn(&maps, 1001, "10.1.1.1");

    let config = load_from_str(CONFIG).unwrap();
    let plane = ControlPlane::new(config, maps.clone(), Arc::new(StaticInterfaceResolver::new()))
        .unwrap();
    plane.start().await.unwrap();
    let route = RouteKey::Listen { ifindex: 1, port: 443 };

    let (tx, mut rx) = mpsc::unbounded_channel();
    plane
        .drain_backend(
            "web",
            "10.1.1.1:8080",
            Some(5000),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .unwrap();

    // The zeroed weight is pushed before drain_backend returns.
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![0, 100]));
    let drains = plane.drains();
    assert_eq!(drains.len(), 1);
    assert_eq!(drains[0].initial_conn_count, 2);

    // Kernel releases the connections; the watcher completes the drain
    // within roughly one check interval.
    clear_conns(&maps);
    let outcome = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("drain callback within the watcher interval")
        .expect("callback fired");
    assert_eq!(outcome, DrainOutcome::Completed);
    assert!(plane.drains().is_empty());

    plane.shutdown().await;
}

#[tokio::test]
async fn drain_times_out_with_connections_held() {
    let maps = MapSet::in_memory();
    put_conn(&maps, 1000, "10.1.1.1");

    let config = load_from_str(CONFIG).unwrap();
    let plane = ControlPlane::new(config, maps, Arc::new(StaticInterfaceResolver::new())).unwrap();
    plane.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    plane
        .drain_backend(
            "web",
            "10.1.1.1:8080",
            Some(200),
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )
        .unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timeout callback")
        .expect("callback fired");
    assert_eq!(outcome, DrainOutcome::TimedOut);

    plane.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_pending_drains() {
    let maps = MapSet::in_memory();
    put_conn(&maps, 1000, "10.1.1.1");

    let config = load_from_str(CONFIG).unwrap();
    let plane = ControlPlane::new(config, maps, Arc::new(StaticInterfaceResolver::new())).unwrap();
    plane.start().await.unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_cb = fired.clone();
    plane
        .drain_backend(
            "web",
            "10.1.1.1:8080",
            Some(3_600_000),
            Box::new(move |outcome| {
                assert_eq!(outcome, DrainOutcome::Cancelled);
                fired_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    plane.shutdown().await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
