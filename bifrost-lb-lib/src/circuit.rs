//! Per-target circuit breaker.
//!
//! Observations come from health-result events, applied in receipt order.
//! The breaker drives the weight pipeline: OPEN zeroes the target,
//! HALF_OPEN admits a reduced probe share, CLOSED restores it.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{LbError, Result};
use crate::telemetry::Metrics;
use crate::weights::WeightPipeline;

const WATCHER_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitPhase {
    /// Severity ordering used by cluster conflict resolution: OPEN beats
    /// HALF_OPEN beats CLOSED, irrespective of version.
    pub fn severity(&self) -> u8 {
        match self {
            CircuitPhase::Closed => 0,
            CircuitPhase::HalfOpen => 1,
            CircuitPhase::Open => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitPhase::Closed => "closed",
            CircuitPhase::HalfOpen => "half_open",
            CircuitPhase::Open => "open",
        }
    }
}

/// Snapshot of one target's breaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CircuitStatus {
    pub phase: CircuitPhase,
    pub error_count: u32,
    pub success_count: u32,
    pub window_start_ns: u64,
    pub last_transition_ns: u64,
    pub half_open_probes_used: u32,
}

impl CircuitStatus {
    fn new(now: u64) -> Self {
        Self {
            phase: CircuitPhase::Closed,
            error_count: 0,
            success_count: 0,
            window_start_ns: now,
            last_transition_ns: now,
            half_open_probes_used: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitEvent {
    pub target_id: String,
    pub phase: CircuitPhase,
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<String, CircuitStatus>,
    pipeline: Arc<WeightPipeline>,
    events: broadcast::Sender<CircuitEvent>,
    metrics: Option<Arc<Metrics>>,
}

impl CircuitBreaker {
    pub fn new(
        config: CircuitBreakerConfig,
        pipeline: Arc<WeightPipeline>,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { config, states: DashMap::new(), pipeline, events, metrics }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    pub fn register(&self, target_id: &str) {
        self.states
            .entry(target_id.to_string())
            .or_insert_with(|| CircuitStatus::new(now_ns()));
    }

    pub fn unregister(&self, target_id: &str) {
        self.states.remove(target_id);
    }

    pub fn status(&self, target_id: &str) -> Option<CircuitStatus> {
        self.states.get(target_id).map(|s| s.value().clone())
    }

    pub fn list(&self) -> Vec<(String, CircuitStatus)> {
        self.states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Feed one observation. Events within a target are applied in
    /// receipt order; the caller serializes them.
    pub fn record(&self, target_id: &str, success: bool) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = now_ns();
        let transition = {
            let mut entry = self
                .states
                .entry(target_id.to_string())
                .or_insert_with(|| CircuitStatus::new(now));
            let state = entry.value_mut();
            match state.phase {
                CircuitPhase::Closed => {
                    // Rolling window: stale counters start over.
                    if now.saturating_sub(state.window_start_ns)
                        > self.config.window_size_ms * 1_000_000
                    {
                        state.error_count = 0;
                        state.success_count = 0;
                        state.window_start_ns = now;
                    }
                    if success {
                        state.success_count += 1;
                    } else {
                        state.error_count += 1;
                    }
                    let total = state.error_count + state.success_count;
                    if total >= self.config.min_requests
                        && u64::from(state.error_count) * 100
                            >= u64::from(self.config.error_threshold_pct) * u64::from(total)
                    {
                        transition(state, CircuitPhase::Open, now);
                        Some(CircuitPhase::Open)
                    } else {
                        None
                    }
                }
                // The kernel rejects traffic while OPEN; stray
                // observations do not move the machine.
                CircuitPhase::Open => None,
                CircuitPhase::HalfOpen => {
                    state.half_open_probes_used += 1;
                    if success {
                        state.success_count += 1;
                        if state.success_count >= self.config.half_open_requests {
                            transition(state, CircuitPhase::Closed, now);
                            Some(CircuitPhase::Closed)
                        } else {
                            None
                        }
                    } else {
                        transition(state, CircuitPhase::Open, now);
                        Some(CircuitPhase::Open)
                    }
                }
            }
        };
        if let Some(phase) = transition {
            self.notify(target_id, phase)?;
        }
        Ok(())
    }

    pub fn force_open(&self, target_id: &str) -> Result<()> {
        self.force_phase(target_id, CircuitPhase::Open)
    }

    pub fn force_close(&self, target_id: &str) -> Result<()> {
        self.force_phase(target_id, CircuitPhase::Closed)
    }

    /// Reset to a fresh CLOSED state, clearing all counters.
    pub fn reset(&self, target_id: &str) -> Result<()> {
        if self.states.get(target_id).is_none() {
            return Err(LbError::NotFound(format!("circuit {target_id}")));
        }
        self.states.insert(target_id.to_string(), CircuitStatus::new(now_ns()));
        self.notify(target_id, CircuitPhase::Closed)
    }

    /// Adopt a phase decided elsewhere (manual control or cluster sync).
    pub fn apply_phase(&self, target_id: &str, phase: CircuitPhase) -> Result<()> {
        let now = now_ns();
        let changed = {
            let mut entry = self
                .states
                .entry(target_id.to_string())
                .or_insert_with(|| CircuitStatus::new(now));
            let state = entry.value_mut();
            if state.phase == phase {
                false
            } else {
                transition(state, phase, now);
                true
            }
        };
        if changed {
            self.notify(target_id, phase)?;
        }
        Ok(())
    }

    /// Move every OPEN circuit whose open duration has elapsed to
    /// HALF_OPEN. Returns the targets that transitioned.
    pub fn tick(&self) -> Result<Vec<String>> {
        let now = now_ns();
        let open_ns = self.config.open_duration_ms * 1_000_000;
        let mut transitioned = Vec::new();
        for mut entry in self.states.iter_mut() {
            let state = entry.value_mut();
            if state.phase == CircuitPhase::Open
                && now.saturating_sub(state.last_transition_ns) >= open_ns
            {
                transition(state, CircuitPhase::HalfOpen, now);
                transitioned.push(entry.key().clone());
            }
        }
        for target_id in &transitioned {
            self.notify(target_id, CircuitPhase::HalfOpen)?;
        }
        Ok(transitioned)
    }

    /// Watcher loop driving timed OPEN -> HALF_OPEN transitions.
    pub async fn run_watcher(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(WATCHER_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("circuit watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick() {
                        warn!(%err, "circuit watcher tick failed");
                    }
                }
            }
        }
    }

    fn force_phase(&self, target_id: &str, phase: CircuitPhase) -> Result<()> {
        if self.states.get(target_id).is_none() {
            return Err(LbError::NotFound(format!("circuit {target_id}")));
        }
        self.apply_phase(target_id, phase)
    }

    fn notify(&self, target_id: &str, phase: CircuitPhase) -> Result<()> {
        info!(target = target_id, phase = phase.as_str(), "circuit transition");
        if let Some(metrics) = &self.metrics {
            metrics.circuit_transitions_total.with_label_values(&[phase.as_str()]).inc();
        }
        self.pipeline.set_circuit(target_id, phase)?;
        let _ = self
            .events
            .send(CircuitEvent { target_id: target_id.to_string(), phase });
        Ok(())
    }
}

fn transition(state: &mut CircuitStatus, phase: CircuitPhase, now: u64) {
    state.phase = phase;
    state.error_count = 0;
    state.success_count = 0;
    state.half_open_probes_used = 0;
    state.window_start_ns = now;
    state.last_transition_ns = now;
}

pub(crate) fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancingAlgorithm;
    use crate::maps::{MapProgrammer, MapSet};

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        let programmer = Arc::new(MapProgrammer::new(MapSet::in_memory()));
        let pipeline = Arc::new(WeightPipeline::new(
            programmer,
            LoadBalancingAlgorithm::WeightedRandom,
            true,
            None,
        ));
        CircuitBreaker::new(config, pipeline, None)
    }

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            error_threshold_pct: 50,
            min_requests: 5,
            open_duration_ms: 0,
            half_open_requests: 2,
            window_size_ms: 10_000,
        }
    }

    #[test]
    fn opens_on_error_burst() {
        let cb = breaker(fast_config());
        cb.register("10.0.0.1:8080");
        for _ in 0..6 {
            cb.record("10.0.0.1:8080", false).unwrap();
        }
        assert_eq!(cb.status("10.0.0.1:8080").unwrap().phase, CircuitPhase::Open);
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let cb = breaker(fast_config());
        cb.register("t");
        for _ in 0..4 {
            cb.record("t", false).unwrap();
        }
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Closed);
    }

    #[test]
    fn half_open_successes_close() {
        let cb = breaker(fast_config());
        cb.register("t");
        for _ in 0..5 {
            cb.record("t", false).unwrap();
        }
        assert_eq!(cb.tick().unwrap(), vec!["t".to_string()]);
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::HalfOpen);
        cb.record("t", true).unwrap();
        cb.record("t", true).unwrap();
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(fast_config());
        cb.register("t");
        for _ in 0..5 {
            cb.record("t", false).unwrap();
        }
        cb.tick().unwrap();
        cb.record("t", false).unwrap();
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Open);
    }

    #[test]
    fn open_waits_for_duration() {
        let mut config = fast_config();
        config.open_duration_ms = 60_000;
        let cb = breaker(config);
        cb.register("t");
        for _ in 0..5 {
            cb.record("t", false).unwrap();
        }
        // Duration has not elapsed, tick must not move the machine.
        assert!(cb.tick().unwrap().is_empty());
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Open);
    }

    #[test]
    fn manual_controls_override() {
        let cb = breaker(fast_config());
        cb.register("t");
        cb.force_open("t").unwrap();
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Open);
        cb.force_close("t").unwrap();
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Closed);
        assert!(cb.force_open("missing").is_err());
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let mut config = fast_config();
        config.enabled = false;
        let cb = breaker(config);
        cb.register("t");
        for _ in 0..20 {
            cb.record("t", false).unwrap();
        }
        assert_eq!(cb.status("t").unwrap().phase, CircuitPhase::Closed);
    }
}
