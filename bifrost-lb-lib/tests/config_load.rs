use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bifrost_lb_lib::config::{load_from_path, load_from_str, LoadBalancingAlgorithm};

fn tmp_path(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_nanos();
    std::env::temp_dir().join(format!("bifrost-{nanos}-{name}.toml"))
}

#[test]
fn loads_minimal_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let path = tmp_path("minimal");
    let toml = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", port = 8080 }
"#;
    fs::write(&path, toml)?;

    let cfg = load_from_path(&path)?;
    assert_eq!(cfg.proxies.len(), 1);
    assert_eq!(cfg.proxies[0].listen.port, 443);
    assert_eq!(cfg.settings.max_connections, 100_000);
    assert_eq!(cfg.settings.default_drain_timeout_ms, 30_000);
    assert_eq!(cfg.settings.load_balancing.algorithm, LoadBalancingAlgorithm::WeightedRandom);
    Ok(())
}

#[test]
fn loads_full_featured_config() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let toml = r#"
[[proxies]]
name = "web"
session_persistence = true
listen = { interfaces = ["eth0", "eth1"], port = 443 }
default_target = [
  { ip = "10.0.0.1", port = 8080, weight = 60, proxy_protocol = "v2" },
  { host = "backend.internal", port = 8080, weight = 40, dns_refresh_seconds = 10 },
]
source_routes = [
  { source = "192.168.0.0/16", target = { ip = "10.0.1.1", port = 8080 } },
]
sni_routes = [
  { sni_hostname = "API.Example.com", target = { ip = "10.0.2.1", port = 8443 } },
]

[settings]
stats_enabled = true
max_connections = 50000

[settings.rate_limits]
per_source = { requests_per_sec = 100, burst = 200 }

[settings.load_balancing]
algorithm = "least_connections"
weighted = false

[settings.cluster]
enabled = true
bind_address = "127.0.0.1"
bind_port = 7946
seeds = ["127.0.0.1:7947"]
"#;
    let cfg = load_from_str(toml)?;
    let proxy = &cfg.proxies[0];
    assert_eq!(proxy.listen.interfaces.len(), 2);
    assert_eq!(proxy.source_routes.len(), 1);
    assert_eq!(proxy.sni_routes.len(), 1);
    assert_eq!(cfg.settings.load_balancing.algorithm, LoadBalancingAlgorithm::LeastConnections);
    assert!(!cfg.settings.load_balancing.weighted);
    assert_eq!(cfg.settings.rate_limits.per_source.unwrap().burst, Some(200));
    assert!(cfg.settings.cluster.enabled);
    assert_eq!(cfg.settings.cluster.gossip_interval_ms, 200);
    assert_eq!(cfg.settings.cluster.gossip_fanout, 3);
    Ok(())
}

#[test]
fn rejects_weight_sum_mismatch() {
    let toml = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = [
  { ip = "10.0.0.1", port = 8080, weight = 50 },
  { ip = "10.0.0.2", port = 8080, weight = 40 },
]
"#;
    let err = load_from_str(toml).unwrap_err();
    assert_eq!(err.kind(), "INVALID_PARAM");
}

#[test]
fn rejects_duplicate_proxy_names() {
    let toml = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", port = 8080 }

[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 8443 }
default_target = { ip = "10.0.0.2", port = 8080 }
"#;
    let err = load_from_str(toml).unwrap_err();
    assert_eq!(err.kind(), "OPERATION_FAILED");
}

#[test]
fn rejects_bad_cidr() {
    let toml = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", port = 8080 }
source_routes = [
  { source = "not-a-cidr", target = { ip = "10.0.1.1", port = 8080 } },
]
"#;
    let err = load_from_str(toml).unwrap_err();
    assert_eq!(err.kind(), "INVALID_PARAM");
}

#[test]
fn rejects_out_of_range_settings() {
    let toml = r#"
[settings]
connection_timeout_sec = 100000
"#;
    let err = load_from_str(toml).unwrap_err();
    assert_eq!(err.kind(), "INVALID_PARAM");

    let toml = r#"
[settings]
drain_check_interval_ms = 10
"#;
    assert!(load_from_str(toml).is_err());
}

#[test]
fn rejects_target_with_ip_and_host() {
    let toml = r#"
[[proxies]]
name = "web"
listen = { interfaces = ["eth0"], port = 443 }
default_target = { ip = "10.0.0.1", host = "backend", port = 8080 }
"#;
    assert!(load_from_str(toml).is_err());
}
