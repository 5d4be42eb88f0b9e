//! Health-driven weight redistribution observed end to end: probe
//! results flow through the checker into the pipeline and out to the
//! listen map.

use std::sync::Arc;

use bifrost_lb_lib::codec::{
    WeightedRouteValue, FLAG_PROXY_PROTOCOL_V2, FLAG_SESSION_PERSISTENCE,
};
use bifrost_lb_lib::config::load_from_str;
use bifrost_lb_lib::maps::RouteKey;
use bifrost_lb_lib::runtime::StaticInterfaceResolver;
use bifrost_lb_lib::{ControlPlane, MapSet};

const CONFIG: &str = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = [
  { ip = "10.0.0.1", port = 8080, weight = 50, health_check = { kind = "tcp" } },
  { ip = "10.0.0.2", port = 8080, weight = 50, health_check = { kind = "tcp" } },
]

# Keep the breaker out of the way so only the health mask moves weights.
[settings.circuit_breaker]
enabled = false
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

fn listen_route() -> RouteKey {
    RouteKey::Listen { ifindex: 1, port: 443 }
}

#[tokio::test]
async fn unhealthy_target_loses_its_share() {
    let plane = started_plane().await;
    let route = listen_route();

    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![50, 50]));

    // Three consecutive failures: second target goes UNHEALTHY.
    for _ in 0..3 {
        plane.health().record_result("10.0.0.2:8080", false, 0.001).unwrap();
    }
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![100, 0]));

    // Two consecutive successes restore it.
    for _ in 0..2 {
        plane.health().record_result("10.0.0.2:8080", true, 0.001).unwrap();
    }
    assert_eq!(plane.pipeline().effective_weights("web", &route), Some(vec![50, 50]));

    plane.shutdown().await;
}

#[tokio::test]
async fn kernel_map_tracks_cumulative_weights() {
    let plane = started_plane().await;

    for _ in 0..3 {
        plane.health().record_result("10.0.0.2:8080", false, 0.001).unwrap();
    }

    let listens = plane.programmer().list_listen_ports().unwrap();
    // One entry per address family.
    assert_eq!(listens.len(), 2);
    let (_, route): &(_, WeightedRouteValue) = &listens[0];
    assert_eq!(route.targets.len(), 2);
    assert_eq!(route.targets[0].cumulative_weight, 100);
    assert_eq!(route.targets[1].cumulative_weight, 100);

    plane.shutdown().await;
}

#[tokio::test]
async fn route_flags_reach_the_kernel_value() {
    let config = load_from_str(
        r#"
[[proxies]]
name = "web"
session_persistence = true
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", port = 8080, proxy_protocol = "v2" }
"#,
    )
    .unwrap();
    let plane = ControlPlane::new(
        config,
        MapSet::in_memory(),
        Arc::new(StaticInterfaceResolver::new()),
    )
    .unwrap();
    plane.start().await.unwrap();

    let listens = plane.programmer().list_listen_ports().unwrap();
    let (_, route) = &listens[0];
    assert_eq!(route.flags & FLAG_SESSION_PERSISTENCE, FLAG_SESSION_PERSISTENCE);
    assert_eq!(route.flags & FLAG_PROXY_PROTOCOL_V2, FLAG_PROXY_PROTOCOL_V2);

    plane.shutdown().await;
}
