//! The effective-weight pipeline.
//!
//! Base weights flow through least-connections scoring, then the health,
//! drain and circuit masks, and finally largest-remainder normalization
//! before being written to the kernel. Each subsystem feeds its facts in
//! through a setter; every change recomputes the groups that contain the
//! affected target and pushes the result if it differs from what the
//! kernel holds.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::circuit::CircuitPhase;
use crate::codec::{WeightedRouteValue, WeightedTarget};
use crate::config::LoadBalancingAlgorithm;
use crate::error::Result;
use crate::maps::{MapProgrammer, RouteKey};
use crate::target::TargetGroup;
use crate::telemetry::Metrics;

/// Identifies one weighted-route entry: a group within a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupId {
    pub proxy: String,
    pub route: RouteKey,
}

/// Facts about a single target, merged across subsystems. A target with
/// no health check stays `healthy = true`; UNKNOWN status also routes
/// (only a confirmed UNHEALTHY masks the target).
#[derive(Debug, Clone)]
struct TargetFacts {
    healthy: bool,
    draining: bool,
    circuit: CircuitPhase,
    connections: u64,
}

impl Default for TargetFacts {
    fn default() -> Self {
        Self { healthy: true, draining: false, circuit: CircuitPhase::Closed, connections: 0 }
    }
}

struct GroupEntry {
    group: TargetGroup,
    flags: u16,
    /// Bumped on every recompute; pushes are serialized per group by the
    /// map entry lock, so an older computation can never overwrite a
    /// newer one.
    version: u64,
    last_weights: Vec<u8>,
}

pub struct WeightPipeline {
    programmer: Arc<MapProgrammer>,
    algorithm: LoadBalancingAlgorithm,
    weighted: bool,
    groups: DashMap<GroupId, GroupEntry>,
    facts: DashMap<String, TargetFacts>,
    metrics: Option<Arc<Metrics>>,
}

impl WeightPipeline {
    pub fn new(
        programmer: Arc<MapProgrammer>,
        algorithm: LoadBalancingAlgorithm,
        weighted: bool,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            programmer,
            algorithm,
            weighted,
            groups: DashMap::new(),
            facts: DashMap::new(),
            metrics,
        }
    }

    /// Register (or replace) a group and push its initial weights.
    pub fn register_group(
        &self,
        proxy: &str,
        route: RouteKey,
        group: TargetGroup,
        flags: u16,
    ) -> Result<()> {
        let id = GroupId { proxy: proxy.to_string(), route };
        self.groups.insert(
            id.clone(),
            GroupEntry { group, flags, version: 0, last_weights: Vec::new() },
        );
        self.recompute_group(&id)
    }

    pub fn remove_group(&self, proxy: &str, route: &RouteKey) -> bool {
        self.groups.remove(&GroupId { proxy: proxy.to_string(), route: route.clone() }).is_some()
    }

    pub fn set_health(&self, target_id: &str, healthy: bool) -> Result<()> {
        self.facts.entry(target_id.to_string()).or_default().healthy = healthy;
        self.recompute_for_target(target_id)
    }

    pub fn set_draining(&self, target_id: &str, draining: bool) -> Result<()> {
        self.facts.entry(target_id.to_string()).or_default().draining = draining;
        self.recompute_for_target(target_id)
    }

    pub fn set_circuit(&self, target_id: &str, phase: CircuitPhase) -> Result<()> {
        self.facts.entry(target_id.to_string()).or_default().circuit = phase;
        self.recompute_for_target(target_id)
    }

    /// Refresh connection counts (keyed by target id) and recompute every
    /// group. Only meaningful under `least_connections`.
    pub fn set_connection_counts(&self, counts: &HashMap<String, u64>) -> Result<()> {
        for mut entry in self.facts.iter_mut() {
            entry.value_mut().connections = counts.get(entry.key()).copied().unwrap_or(0);
        }
        for (id, count) in counts {
            self.facts
                .entry(id.clone())
                .or_default()
                .connections = *count;
        }
        if self.algorithm == LoadBalancingAlgorithm::LeastConnections {
            self.recompute_all()?;
        }
        Ok(())
    }

    /// Drop per-target facts once nothing references the target anymore.
    pub fn forget_target(&self, target_id: &str) {
        self.facts.remove(target_id);
    }

    pub fn recompute_all(&self) -> Result<()> {
        let ids: Vec<GroupId> = self.groups.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.recompute_group(&id)?;
        }
        Ok(())
    }

    /// Current effective weights for a group, as last pushed.
    pub fn effective_weights(&self, proxy: &str, route: &RouteKey) -> Option<Vec<u8>> {
        self.groups
            .get(&GroupId { proxy: proxy.to_string(), route: route.clone() })
            .map(|e| e.last_weights.clone())
    }

    /// First group of `proxy` containing `target_id`, if any.
    pub fn find_group(&self, proxy: &str, target_id: &str) -> Option<(RouteKey, TargetGroup)> {
        self.groups
            .iter()
            .find(|e| e.key().proxy == proxy && e.value().group.contains(target_id))
            .map(|e| (e.key().route.clone(), e.value().group.clone()))
    }

    /// Route keys registered for `proxy`.
    pub fn proxy_routes(&self, proxy: &str) -> Vec<RouteKey> {
        self.groups
            .iter()
            .filter(|e| e.key().proxy == proxy)
            .map(|e| e.key().route.clone())
            .collect()
    }

    /// Distinct target ids across every group of `proxy`.
    pub fn proxy_target_ids(&self, proxy: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for entry in self.groups.iter() {
            if entry.key().proxy != proxy {
                continue;
            }
            for target in entry.value().group.targets() {
                let id = target.id();
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }
        ids
    }

    pub fn group_version(&self, proxy: &str, route: &RouteKey) -> Option<u64> {
        self.groups
            .get(&GroupId { proxy: proxy.to_string(), route: route.clone() })
            .map(|e| e.version)
    }

    fn recompute_for_target(&self, target_id: &str) -> Result<()> {
        let ids: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|e| e.value().group.contains(target_id))
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            self.recompute_group(&id)?;
        }
        Ok(())
    }

    fn recompute_group(&self, id: &GroupId) -> Result<()> {
        let Some(mut entry) = self.groups.get_mut(id) else {
            return Ok(());
        };
        let n = entry.group.len();
        let mut original = Vec::with_capacity(n);
        let mut health = Vec::with_capacity(n);
        let mut drain = Vec::with_capacity(n);
        let mut circuit = Vec::with_capacity(n);
        let mut connections = Vec::with_capacity(n);
        let mut endpoints = Vec::with_capacity(n);
        for t in entry.group.targets() {
            let facts =
                self.facts.get(&t.id()).map(|f| f.value().clone()).unwrap_or_default();
            original.push(t.weight);
            health.push(facts.healthy);
            drain.push(facts.draining);
            circuit.push(facts.circuit);
            connections.push(facts.connections);
            endpoints.push((t.address, t.port));
        }

        let effective = compute_effective_weights(
            &original,
            &health,
            &drain,
            &circuit,
            Some(&connections),
            self.algorithm,
            self.weighted,
        );

        entry.version += 1;
        if effective == entry.last_weights {
            return Ok(());
        }

        let mut cumulative = 0u16;
        let route_targets: Vec<WeightedTarget> = endpoints
            .iter()
            .zip(&effective)
            .map(|((ip, port), w)| {
                cumulative = cumulative.saturating_add(u16::from(*w)).min(100);
                WeightedTarget { ip: *ip, port: *port, cumulative_weight: cumulative as u8 }
            })
            .collect();
        let value = WeightedRouteValue::new(entry.flags, route_targets)?;
        let changed = self.programmer.write_route(&id.route, &value)?;
        if changed {
            if let Some(metrics) = &self.metrics {
                metrics.weight_pushes_total.with_label_values(&[&id.proxy]).inc();
            }
            debug!(proxy = %id.proxy, weights = ?effective, version = entry.version, "effective weights pushed");
        }
        if effective.iter().all(|w| *w == 0) {
            warn!(proxy = %id.proxy, "all targets masked, group rejects traffic");
        }
        entry.last_weights = effective;
        Ok(())
    }
}

/// Pure pipeline: base weights through least-connections, health, drain
/// and circuit stages, then normalization.
///
/// Masked targets (unhealthy, draining or circuit-OPEN) always end at
/// zero; when every target is masked the output is all-zero and the
/// kernel rejects new connections for the group. HALF_OPEN targets are
/// held at 10% of their current weight (minimum 1) and are not scaled
/// back up by normalization, so a group with only half-open survivors
/// admits reduced traffic rather than full load.
pub fn compute_effective_weights(
    original: &[u8],
    health: &[bool],
    drain: &[bool],
    circuit: &[CircuitPhase],
    connections: Option<&[u64]>,
    algorithm: LoadBalancingAlgorithm,
    weighted: bool,
) -> Vec<u8> {
    let n = original.len();
    if n == 0 {
        return Vec::new();
    }
    let mut w: Vec<f64> = original.iter().map(|x| f64::from(*x)).collect();

    // Least-connections scoring replaces the base distribution.
    if algorithm == LoadBalancingAlgorithm::LeastConnections {
        if let Some(conns) = connections {
            let scores: Vec<f64> = (0..n)
                .map(|i| {
                    let denom = conns.get(i).copied().unwrap_or(0) as f64 + 1.0;
                    if weighted {
                        w[i] / denom
                    } else {
                        1.0 / denom
                    }
                })
                .collect();
            let total: f64 = scores.iter().sum();
            if total > 0.0 {
                w = scores.into_iter().map(|s| s / total * 100.0).collect();
            }
        }
    }

    mask_and_redistribute(&mut w, |i| health[i]);
    mask_and_redistribute(&mut w, |i| !drain[i]);

    // Circuit stage: OPEN mass moves to CLOSED targets; HALF_OPEN keeps a
    // reduced absolute share.
    let mut open_mass = 0.0;
    for i in 0..n {
        match circuit[i] {
            CircuitPhase::Open => {
                open_mass += w[i];
                w[i] = 0.0;
            }
            CircuitPhase::HalfOpen => {
                if w[i] > 0.0 {
                    w[i] = (w[i] * 0.1).max(1.0);
                }
            }
            CircuitPhase::Closed => {}
        }
    }
    let closed_sum: f64 =
        (0..n).filter(|i| circuit[*i] == CircuitPhase::Closed).map(|i| w[i]).sum();
    if open_mass > 0.0 && closed_sum > 0.0 {
        let scale = (closed_sum + open_mass) / closed_sum;
        for i in 0..n {
            if circuit[i] == CircuitPhase::Closed {
                w[i] *= scale;
            }
        }
    }

    normalize(&w, circuit)
}

/// Zero targets failing `keep` and scale the survivors so the stage
/// preserves total mass. All targets masked leaves the vector all-zero.
fn mask_and_redistribute<F: Fn(usize) -> bool>(w: &mut [f64], keep: F) {
    let total: f64 = w.iter().sum();
    let kept: f64 = w.iter().enumerate().filter(|(i, _)| keep(*i)).map(|(_, v)| *v).sum();
    for (i, v) in w.iter_mut().enumerate() {
        if !keep(i) {
            *v = 0.0;
        } else if kept > 0.0 {
            *v *= total / kept;
        }
    }
}

/// Largest-remainder rounding to a 100 total. HALF_OPEN survivors are
/// fixed at their reduced value (rounded, minimum 1); the remaining
/// budget is split across CLOSED survivors.
fn normalize(w: &[f64], circuit: &[CircuitPhase]) -> Vec<u8> {
    let n = w.len();
    let mut out = vec![0u8; n];

    let mut fixed_sum: u32 = 0;
    for i in 0..n {
        if circuit[i] == CircuitPhase::HalfOpen && w[i] > 0.0 {
            let v = (w[i].round() as u32).clamp(1, 100);
            out[i] = v as u8;
            fixed_sum += v;
        }
    }

    let variable: Vec<usize> =
        (0..n).filter(|i| circuit[*i] != CircuitPhase::HalfOpen && w[*i] > 0.0).collect();
    let var_sum: f64 = variable.iter().map(|i| w[*i]).sum();
    if variable.is_empty() || var_sum <= 0.0 {
        return out;
    }

    let budget = 100u32.saturating_sub(fixed_sum);
    let quotas: Vec<f64> = variable.iter().map(|i| w[*i] * f64::from(budget) / var_sum).collect();
    let mut assigned: u32 = 0;
    let mut floors = Vec::with_capacity(variable.len());
    for q in &quotas {
        let f = q.floor() as u32;
        floors.push(f);
        assigned += f;
    }
    let mut order: Vec<usize> = (0..variable.len()).collect();
    order.sort_by(|a, b| {
        let ra = quotas[*a] - quotas[*a].floor();
        let rb = quotas[*b] - quotas[*b].floor();
        rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut leftover = budget.saturating_sub(assigned);
    for idx in order {
        if leftover == 0 {
            break;
        }
        floors[idx] += 1;
        leftover -= 1;
    }
    for (slot, value) in variable.iter().zip(floors) {
        out[*slot] = value.min(100) as u8;
    }
    out
}
