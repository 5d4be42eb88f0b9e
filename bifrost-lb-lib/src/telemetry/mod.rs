//! In-process metrics.
//!
//! The Prometheus HTTP exporter is a collaborator; this module only owns
//! the registry and instrument handles the subsystems record into.

use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

use crate::error::{LbError, Result};

/// Health-check latency buckets in seconds, cumulative.
const HEALTH_LATENCY_BUCKETS: &[f64] =
    &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

#[derive(Clone)]
pub struct Metrics {
    /// Probe latency per (proxy, target)
    pub health_check_duration_seconds: HistogramVec,
    /// Probe outcomes per (target, result)
    pub health_checks_total: IntCounterVec,
    /// Circuit transitions per new state
    pub circuit_transitions_total: IntCounterVec,
    /// Weighted-route rewrites per proxy
    pub weight_pushes_total: IntCounterVec,
    /// Gossip datagrams per message kind and direction
    pub gossip_messages_total: IntCounterVec,
}

impl Metrics {
    fn new() -> Result<Self> {
        Ok(Self {
            health_check_duration_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "lb_health_check_duration_seconds",
                    "Health probe duration in seconds",
                )
                .buckets(HEALTH_LATENCY_BUCKETS.to_vec()),
                &["proxy", "target"],
            )
            .map_err(internal)?,
            health_checks_total: IntCounterVec::new(
                Opts::new("lb_health_checks_total", "Total health probes by result"),
                &["target", "result"],
            )
            .map_err(internal)?,
            circuit_transitions_total: IntCounterVec::new(
                Opts::new("lb_circuit_transitions_total", "Circuit breaker transitions by state"),
                &["state"],
            )
            .map_err(internal)?,
            weight_pushes_total: IntCounterVec::new(
                Opts::new("lb_weight_pushes_total", "Weighted-route map rewrites"),
                &["proxy"],
            )
            .map_err(internal)?,
            gossip_messages_total: IntCounterVec::new(
                Opts::new("lb_gossip_messages_total", "Gossip datagrams by kind and direction"),
                &["kind", "direction"],
            )
            .map_err(internal)?,
        })
    }
}

fn internal(e: prometheus::Error) -> LbError {
    LbError::Internal(format!("metric registration failed: {e}"))
}

/// Build the metric set and register it on a fresh registry.
pub fn init_metrics() -> Result<(Arc<Metrics>, Registry)> {
    let registry = Registry::new();
    let metrics = Metrics::new()?;

    registry
        .register(Box::new(metrics.health_check_duration_seconds.clone()))
        .map_err(internal)?;
    registry
        .register(Box::new(metrics.health_checks_total.clone()))
        .map_err(internal)?;
    registry
        .register(Box::new(metrics.circuit_transitions_total.clone()))
        .map_err(internal)?;
    registry
        .register(Box::new(metrics.weight_pushes_total.clone()))
        .map_err(internal)?;
    registry
        .register(Box::new(metrics.gossip_messages_total.clone()))
        .map_err(internal)?;

    Ok((Arc::new(metrics), registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once() {
        let (metrics, registry) = init_metrics().unwrap();
        metrics
            .health_check_duration_seconds
            .with_label_values(&["web", "10.0.0.1:8080"])
            .observe(0.004);
        metrics.health_checks_total.with_label_values(&["10.0.0.1:8080", "success"]).inc();
        assert!(!registry.gather().is_empty());
    }
}
