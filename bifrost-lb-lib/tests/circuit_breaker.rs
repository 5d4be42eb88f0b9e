//! Circuit breaker end to end: observations through the state machine,
//! timed half-open admission, and the weights the kernel would see.

use std::sync::Arc;
use std::time::Duration;

use bifrost_lb_lib::circuit::CircuitPhase;
use bifrost_lb_lib::config::load_from_str;
use bifrost_lb_lib::maps::RouteKey;
use bifrost_lb_lib::runtime::StaticInterfaceResolver;
use bifrost_lb_lib::{ControlPlane, MapSet};

const CONFIG: &str = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", port = 8080 }

[settings.circuit_breaker]
error_threshold_pct = 50
min_requests = 5
open_duration_ms = 300
half_open_requests = 2
"#;

async fn started_plane() -> Arc<ControlPlane> {
    let config = load_from_str(CONFIG).unwrap();
    let plane = ControlPlane::new(
        config,
        MapSet::in_memory(),
        Arc::new(StaticInterfaceResolver::new()),
    )
    .unwrap();
    plane.start().await.unwrap();
    plane
}

#[tokio::test]
async fn error_burst_opens_then_probes_then_closes() {
    let plane = started_plane().await;
    let route = RouteKey::Listen { ifindex: 1, port: 443 };
    let target = "10.0.0.1:8080";

    // Six failed observations: the breaker opens and the weight goes to
    // zero.
    for _ in 0..6 {
        plane.circuit().record(target, false).unwrap();
    }
    assert_eq!(plane.circuit().status(target).unwrap().phase, CircuitPhase::Open);
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![0]));

    // The open duration elapses and the watcher admits probes at a
    // reduced share.
    wait_for_phase(&plane, target, CircuitPhase::HalfOpen).await;
    wait_for_weights(&plane, &route, vec![10]).await;

    // Two successes close the circuit and restore the weight.
    plane.circuit().record(target, true).unwrap();
    plane.circuit().record(target, true).unwrap();
    assert_eq!(plane.circuit().status(target).unwrap().phase, CircuitPhase::Closed);
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![100]));

    plane.shutdown().await;
}

#[tokio::test]
async fn half_open_failure_reopens() {
    let plane = started_plane().await;
    let target = "10.0.0.1:8080";

    for _ in 0..6 {
        plane.circuit().record(target, false).unwrap();
    }
    wait_for_phase(&plane, target, CircuitPhase::HalfOpen).await;

    plane.circuit().record(target, false).unwrap();
    assert_eq!(plane.circuit().status(target).unwrap().phase, CircuitPhase::Open);

    plane.shutdown().await;
}

#[tokio::test]
async fn manual_force_open_zeroes_weight() {
    let plane = started_plane().await;
    let route = RouteKey::Listen { ifindex: 1, port: 443 };

    plane.circuit().force_open("10.0.0.1:8080").unwrap();
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![0]));
    plane.circuit().force_close("10.0.0.1:8080").unwrap();
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![100]));

    plane.shutdown().await;
}

async fn wait_for_phase(plane: &Arc<ControlPlane>, target: &str, phase: CircuitPhase) {
    for _ in 0..150 {
        // The open-duration watcher runs asynchronously; poll until it
        // catches up.
        if plane.circuit().status(target).map(|s| s.phase) == Some(phase) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("target {target} never reached {phase:?}");
}

async fn wait_for_weights(plane: &Arc<ControlPlane>, route: &RouteKey, expected: Vec<u8>) {
    for _ in 0..150 {
        if plane.pipeline().effective_weights("web", route) == Some(expected.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "weights never became {expected:?}, last = {:?}",
        plane.pipeline().effective_weights("web", route)
    );
}
