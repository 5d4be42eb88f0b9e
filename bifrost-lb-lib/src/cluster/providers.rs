//! Adapters between the gossip store and the owning subsystems.

use std::sync::Arc;

use serde_json::json;

use super::state::{StateProvider, StateType};
use crate::circuit::{CircuitBreaker, CircuitPhase};
use crate::drain::DrainEngine;
use crate::error::{LbError, Result};
use crate::health::{HealthChecker, HealthStatus};
use crate::weights::WeightPipeline;

/// A peer may gossip about targets this node does not serve; those
/// states are kept in the store but have no local subsystem to land in.
fn ignore_unknown(result: Result<()>) -> Result<()> {
    match result {
        Err(LbError::NotFound(_)) => Ok(()),
        other => other,
    }
}

pub struct HealthStateProvider {
    checker: Arc<HealthChecker>,
}

impl HealthStateProvider {
    pub fn new(checker: Arc<HealthChecker>) -> Self {
        Self { checker }
    }
}

impl StateProvider for HealthStateProvider {
    fn state_type(&self) -> StateType {
        StateType::Health
    }

    fn snapshot(&self) -> Vec<(String, serde_json::Value)> {
        self.checker
            .list()
            .into_iter()
            .filter_map(|(key, status)| {
                serde_json::to_value(status).ok().map(|value| (key, value))
            })
            .collect()
    }

    fn apply(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let status: HealthStatus = serde_json::from_value(value.clone())
            .map_err(|e| LbError::invalid_param("health state", e.to_string()))?;
        ignore_unknown(self.checker.apply_status(key, status))
    }
}

pub struct CircuitStateProvider {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitStateProvider {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl StateProvider for CircuitStateProvider {
    fn state_type(&self) -> StateType {
        StateType::CircuitBreaker
    }

    fn snapshot(&self) -> Vec<(String, serde_json::Value)> {
        self.breaker
            .list()
            .into_iter()
            .filter_map(|(key, status)| {
                serde_json::to_value(status).ok().map(|value| (key, value))
            })
            .collect()
    }

    fn apply(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let phase: CircuitPhase = value
            .get("phase")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| LbError::invalid_param("circuit state", e.to_string()))?
            .ok_or_else(|| LbError::MissingParam("phase"))?;
        self.breaker.apply_phase(key, phase)
    }
}

pub struct DrainStateProvider {
    engine: Arc<DrainEngine>,
    pipeline: Arc<WeightPipeline>,
}

impl DrainStateProvider {
    pub fn new(engine: Arc<DrainEngine>, pipeline: Arc<WeightPipeline>) -> Self {
        Self { engine, pipeline }
    }
}

impl StateProvider for DrainStateProvider {
    fn state_type(&self) -> StateType {
        StateType::Drain
    }

    fn snapshot(&self) -> Vec<(String, serde_json::Value)> {
        self.engine
            .list()
            .into_iter()
            .map(|status| {
                (
                    status.target_id.clone(),
                    json!({ "draining": true, "proxy": status.proxy_name }),
                )
            })
            .collect()
    }

    fn apply(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let draining = value.get("draining").and_then(|v| v.as_bool()).unwrap_or(false);
        // A peer's drain masks the target here too; the peer's engine
        // owns the lifecycle and will gossip the release.
        self.pipeline.set_draining(key, draining)
    }
}
