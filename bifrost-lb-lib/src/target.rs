//! Weighted target groups and the cumulative-weight selection model.
//!
//! The kernel picks a backend by drawing a random value in `0..100` and
//! scanning the cumulative-weight array; [`TargetGroup::pick`] mirrors
//! that lookup for cross-validation in tests.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

use crate::config::HealthCheckConfig;
use crate::error::LbError;

pub const MAX_GROUP_TARGETS: usize = 8;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GroupError {
    #[error("target weights must sum to 100, got {0}")]
    WeightSumMismatch(u32),

    #[error("target group holds at most {MAX_GROUP_TARGETS} targets, got {0}")]
    TargetCountExceeded(usize),

    #[error("duplicate target {0}")]
    DuplicateTarget(String),

    #[error("target weight must be in 1..=100, got {0}")]
    WeightOutOfRange(u8),

    #[error("target group cannot be empty")]
    Empty,
}

impl From<GroupError> for LbError {
    fn from(e: GroupError) -> Self {
        LbError::OperationFailed(e.to_string())
    }
}

/// One backend endpoint with its share of the group weight.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub address: IpAddr,
    pub port: u16,
    /// Base weight in `1..=100`; weights across a multi-target group sum
    /// to exactly 100.
    pub weight: u8,
    pub proxy_protocol_v2: bool,
    pub health_check: Option<HealthCheckConfig>,
}

impl Target {
    pub fn new(address: IpAddr, port: u16, weight: u8) -> Self {
        Self { address, port, weight, proxy_protocol_v2: false, health_check: None }
    }

    /// Stable `ip:port` identifier used across health, circuit, drain and
    /// cluster state keys.
    pub fn id(&self) -> String {
        match self.address {
            IpAddr::V4(v4) => format!("{v4}:{}", self.port),
            IpAddr::V6(v6) => format!("[{v6}]:{}", self.port),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (w={})", self.id(), self.weight)
    }
}

/// Ordered targets plus the parallel cumulative-weight array written to
/// the kernel. The last cumulative weight is always 100.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetGroup {
    targets: Vec<Target>,
    cumulative_weights: Vec<u16>,
}

impl TargetGroup {
    pub fn new(targets: Vec<Target>) -> Result<Self, GroupError> {
        if targets.is_empty() {
            return Err(GroupError::Empty);
        }
        if targets.len() > MAX_GROUP_TARGETS {
            return Err(GroupError::TargetCountExceeded(targets.len()));
        }
        let mut seen = HashSet::new();
        for t in &targets {
            if t.weight == 0 || t.weight > 100 {
                return Err(GroupError::WeightOutOfRange(t.weight));
            }
            if !seen.insert((t.address, t.port)) {
                return Err(GroupError::DuplicateTarget(t.id()));
            }
        }
        if targets.len() > 1 {
            let sum: u32 = targets.iter().map(|t| u32::from(t.weight)).sum();
            if sum != 100 {
                return Err(GroupError::WeightSumMismatch(sum));
            }
        }
        let cumulative_weights = cumulative(&targets);
        Ok(Self { targets, cumulative_weights })
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn cumulative_weights(&self) -> &[u16] {
        &self.cumulative_weights
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.targets.iter().any(|t| t.id() == target_id)
    }

    /// Index selected for a random draw `r` in `0..100`: the first `i`
    /// with `r < cumulative_weights[i]`. Mirrors the kernel lookup.
    pub fn pick(&self, r: u8) -> usize {
        let r = u16::from(r.min(99));
        self.cumulative_weights
            .iter()
            .position(|cw| r < *cw)
            .unwrap_or(self.targets.len() - 1)
    }
}

/// A group whose membership is partly DNS-backed: hostnames awaiting (or
/// between) resolutions alongside the statically addressed targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsTargetGroup {
    pub hostnames: Vec<DnsHost>,
    pub static_targets: Vec<Target>,
}

/// A hostname entry of a DNS-backed group, carrying the weight share the
/// resolver spreads across the addresses it resolves to.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsHost {
    pub hostname: String,
    pub port: u16,
    pub weight: u8,
    pub proxy_protocol_v2: bool,
    pub refresh_seconds: u64,
    pub health_check: Option<HealthCheckConfig>,
}

/// Spread `total` weight as evenly as possible over `n` resolved
/// addresses; the remainder goes to the last one.
pub fn distribute_weight(total: u8, n: usize) -> Vec<u8> {
    if n == 0 {
        return Vec::new();
    }
    let base = u8::try_from(usize::from(total) / n).unwrap_or(0);
    let mut shares = vec![base; n];
    let assigned = usize::from(base) * n;
    if let Some(last) = shares.last_mut() {
        *last = base.saturating_add(u8::try_from(usize::from(total) - assigned).unwrap_or(0));
    }
    shares
}

fn cumulative(targets: &[Target]) -> Vec<u16> {
    if targets.len() == 1 {
        return vec![100];
    }
    let mut acc = 0u16;
    targets
        .iter()
        .map(|t| {
            acc += u16::from(t.weight);
            acc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(ip: &str, port: u16, weight: u8) -> Target {
        Target::new(ip.parse().unwrap(), port, weight)
    }

    #[test]
    fn cumulative_weights_end_at_100() {
        let group = TargetGroup::new(vec![
            target("10.0.0.1", 8080, 20),
            target("10.0.0.2", 8080, 30),
            target("10.0.0.3", 8080, 50),
        ])
        .unwrap();
        assert_eq!(group.cumulative_weights(), &[20, 50, 100]);
    }

    #[test]
    fn single_target_any_weight() {
        let group = TargetGroup::new(vec![target("10.0.0.1", 8080, 7)]).unwrap();
        assert_eq!(group.cumulative_weights(), &[100]);
    }

    #[test]
    fn weight_sum_mismatch() {
        let err = TargetGroup::new(vec![
            target("10.0.0.1", 8080, 50),
            target("10.0.0.2", 8080, 40),
        ])
        .unwrap_err();
        assert_eq!(err, GroupError::WeightSumMismatch(90));
    }

    #[test]
    fn duplicate_target_rejected() {
        let err = TargetGroup::new(vec![
            target("10.0.0.1", 8080, 50),
            target("10.0.0.1", 8080, 50),
        ])
        .unwrap_err();
        assert!(matches!(err, GroupError::DuplicateTarget(_)));
    }

    #[test]
    fn too_many_targets_rejected() {
        let targets: Vec<Target> = (1..=9)
            .map(|i| {
                let mut t = target(&format!("10.0.0.{i}"), 8080, 11);
                if i == 9 {
                    t.weight = 12;
                }
                t
            })
            .collect();
        let err = TargetGroup::new(targets).unwrap_err();
        assert_eq!(err, GroupError::TargetCountExceeded(9));
    }

    #[test]
    fn pick_respects_boundaries() {
        let group = TargetGroup::new(vec![
            target("10.0.0.1", 8080, 20),
            target("10.0.0.2", 8080, 80),
        ])
        .unwrap();
        assert_eq!(group.pick(0), 0);
        assert_eq!(group.pick(19), 0);
        assert_eq!(group.pick(20), 1);
        assert_eq!(group.pick(99), 1);
    }

    #[test]
    fn weight_distribution_remainder_to_last() {
        assert_eq!(distribute_weight(100, 3), vec![33, 33, 34]);
        assert_eq!(distribute_weight(50, 2), vec![25, 25]);
        assert_eq!(distribute_weight(10, 4), vec![2, 2, 2, 4]);
    }
}
