//! SWIM-style membership table.
//!
//! The prober task drives status transitions: a peer that misses direct
//! and indirect probes goes SUSPECT, and SUSPECT ages into DEAD after
//! `suspicion_mult * ping_interval_ms`. A node that reappears with a
//! higher incarnation is readmitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;

use crate::circuit::now_ns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Alive,
    Suspect,
    Dead,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterNode {
    pub node_id: String,
    pub address: String,
    pub incarnation: u64,
    pub last_seen_ns: u64,
    pub join_time_ns: u64,
    pub status: NodeStatus,
}

pub struct Membership {
    local_id: String,
    local_incarnation: AtomicU64,
    nodes: DashMap<String, ClusterNode>,
    suspicion_timeout: Duration,
}

impl Membership {
    pub fn new(local_id: String, ping_interval: Duration, suspicion_mult: u64) -> Self {
        Self {
            local_id,
            // Wall-clock seed so a restarted node outranks its previous
            // life without coordination.
            local_incarnation: AtomicU64::new(now_ns() / 1_000_000),
            nodes: DashMap::new(),
            suspicion_timeout: ping_interval * suspicion_mult.max(1) as u32,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn local_incarnation(&self) -> u64 {
        self.local_incarnation.load(Ordering::SeqCst)
    }

    /// Refute suspicion by outranking every previously advertised
    /// incarnation.
    pub fn bump_incarnation(&self) -> u64 {
        self.local_incarnation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record life signs from a peer. DEAD nodes are readmitted only
    /// with a higher incarnation.
    pub fn observe_alive(&self, node_id: &str, address: &str, incarnation: u64) {
        if node_id == self.local_id {
            return;
        }
        let now = now_ns();
        let mut entry = self.nodes.entry(node_id.to_string()).or_insert_with(|| {
            info!(node = node_id, address, "node joined");
            ClusterNode {
                node_id: node_id.to_string(),
                address: address.to_string(),
                incarnation,
                last_seen_ns: now,
                join_time_ns: now,
                status: NodeStatus::Alive,
            }
        });
        let node = entry.value_mut();
        if node.status == NodeStatus::Dead && incarnation <= node.incarnation {
            return;
        }
        if node.status != NodeStatus::Alive {
            info!(node = node_id, "node readmitted");
        }
        node.address = address.to_string();
        node.incarnation = node.incarnation.max(incarnation);
        node.last_seen_ns = now;
        node.status = NodeStatus::Alive;
    }

    pub fn mark_suspect(&self, node_id: &str) {
        if let Some(mut node) = self.nodes.get_mut(node_id) {
            if node.status == NodeStatus::Alive {
                info!(node = node_id, "node suspected");
                node.status = NodeStatus::Suspect;
                node.last_seen_ns = now_ns();
            }
        }
    }

    /// Age SUSPECT nodes into DEAD. Returns the nodes that died.
    pub fn tick(&self) -> Vec<String> {
        let now = now_ns();
        let timeout_ns = self.suspicion_timeout.as_nanos() as u64;
        let mut died = Vec::new();
        for mut entry in self.nodes.iter_mut() {
            let node = entry.value_mut();
            if node.status == NodeStatus::Suspect
                && now.saturating_sub(node.last_seen_ns) >= timeout_ns
            {
                node.status = NodeStatus::Dead;
                died.push(entry.key().clone());
            }
        }
        for node in &died {
            info!(node = %node, "node declared dead");
        }
        died
    }

    pub fn nodes(&self) -> Vec<ClusterNode> {
        self.nodes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn alive_nodes(&self) -> Vec<ClusterNode> {
        self.nodes
            .iter()
            .filter(|e| e.value().status == NodeStatus::Alive)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get(&self, node_id: &str) -> Option<ClusterNode> {
        self.nodes.get(node_id).map(|e| e.value().clone())
    }

    /// Up to `k` distinct random alive peers.
    pub fn random_alive(&self, k: usize) -> Vec<ClusterNode> {
        let mut alive = self.alive_nodes();
        alive.shuffle(&mut rand::thread_rng());
        alive.truncate(k);
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> Membership {
        Membership::new("local".to_string(), Duration::from_millis(0), 1)
    }

    #[test]
    fn observes_and_lists_peers() {
        let m = membership();
        m.observe_alive("a", "10.0.0.1:7946", 1);
        m.observe_alive("b", "10.0.0.2:7946", 1);
        // The local node never appears in its own table.
        m.observe_alive("local", "10.0.0.3:7946", 1);
        assert_eq!(m.alive_nodes().len(), 2);
    }

    #[test]
    fn suspect_ages_to_dead() {
        let m = membership();
        m.observe_alive("a", "10.0.0.1:7946", 1);
        m.mark_suspect("a");
        let died = m.tick();
        assert_eq!(died, vec!["a".to_string()]);
        assert!(m.alive_nodes().is_empty());
    }

    #[test]
    fn dead_node_needs_higher_incarnation() {
        let m = membership();
        m.observe_alive("a", "10.0.0.1:7946", 5);
        m.mark_suspect("a");
        m.tick();
        // Same incarnation: still dead.
        m.observe_alive("a", "10.0.0.1:7946", 5);
        assert_eq!(m.get("a").unwrap().status, NodeStatus::Dead);
        // Higher incarnation: readmitted.
        m.observe_alive("a", "10.0.0.1:7946", 6);
        assert_eq!(m.get("a").unwrap().status, NodeStatus::Alive);
    }

    #[test]
    fn random_alive_bounds() {
        let m = membership();
        for i in 0..5 {
            m.observe_alive(&format!("n{i}"), "10.0.0.1:7946", 1);
        }
        assert_eq!(m.random_alive(3).len(), 3);
        assert_eq!(m.random_alive(10).len(), 5);
    }

    #[test]
    fn incarnation_bump_is_monotonic() {
        let m = membership();
        let first = m.local_incarnation();
        assert!(m.bump_incarnation() > first);
    }
}
