use std::collections::HashSet;
use std::net::SocketAddr;

use super::compile::compile_proxy;
use super::types::Config;
use crate::error::{LbError, Result};

/// Validate a full configuration. Per-proxy rules are enforced by
/// compiling each proxy; cross-proxy and settings rules live here.
pub fn validate(cfg: &Config) -> Result<()> {
    let mut names = HashSet::new();
    for proxy in &cfg.proxies {
        if !names.insert(proxy.name.as_str()) {
            return Err(LbError::OperationFailed(format!(
                "duplicate proxy name {:?}",
                proxy.name
            )));
        }
        compile_proxy(proxy)?;
    }

    let s = &cfg.settings;
    check_range("connection_timeout_sec", s.connection_timeout_sec, 1, 86_400)?;
    check_range("max_connections", s.max_connections, 1, 10_000_000)?;
    check_range("default_drain_timeout_ms", s.default_drain_timeout_ms, 1_000, 3_600_000)?;
    check_range("drain_check_interval_ms", s.drain_check_interval_ms, 100, 60_000)?;

    if s.circuit_breaker.error_threshold_pct > 100 {
        return Err(LbError::invalid_param(
            "circuit_breaker.error_threshold_pct",
            "must be in 0..=100",
        ));
    }

    if s.cluster.enabled {
        if s.cluster.bind_port == 0 {
            return Err(LbError::invalid_param("cluster.bind_port", "must be non-zero"));
        }
        if s.cluster.gossip_fanout == 0 {
            return Err(LbError::invalid_param("cluster.gossip_fanout", "must be non-zero"));
        }
        for seed in &s.cluster.seeds {
            if seed.parse::<SocketAddr>().is_err() && !seed.contains(':') {
                return Err(LbError::invalid_param(
                    "cluster.seeds",
                    format!("{seed:?} is not a host:port address"),
                ));
            }
        }
    }

    if let Some(per_source) = &s.rate_limits.per_source {
        if per_source.requests_per_sec == 0 {
            return Err(LbError::invalid_param(
                "rate_limits.per_source.requests_per_sec",
                "must be non-zero",
            ));
        }
    }
    if let Some(per_backend) = &s.rate_limits.per_backend {
        if per_backend.requests_per_sec == 0 {
            return Err(LbError::invalid_param(
                "rate_limits.per_backend.requests_per_sec",
                "must be non-zero",
            ));
        }
    }

    Ok(())
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(LbError::invalid_param(
            field,
            format!("must be in {min}..={max}, got {value}"),
        ));
    }
    Ok(())
}
