//! Gossiped state entries and per-type conflict resolution.

use std::collections::HashMap;
use std::sync::Mutex;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateType {
    Health,
    CircuitBreaker,
    Drain,
}

impl StateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateType::Health => "HEALTH",
            StateType::CircuitBreaker => "CIRCUIT_BREAKER",
            StateType::Drain => "DRAIN",
        }
    }
}

/// One versioned state entry, opaque to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableState {
    pub state_type: StateType,
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
    pub source_node: String,
    pub timestamp_ns: u64,
}

impl SyncableState {
    pub fn digest_key(&self) -> String {
        format!("{}:{}", self.state_type.as_str(), self.key)
    }
}

/// Whether `remote` supersedes `local` under the per-type rules:
///
/// - Health: newest `last_check_ns` wins; Lamport version then
///   source-node ordering break ties.
/// - Circuit breaker: OPEN beats HALF_OPEN beats CLOSED irrespective of
///   version; within equal severity, higher version wins.
/// - Drain: DRAINING beats any non-draining; within equal status, higher
///   version wins.
pub fn remote_wins(local: &SyncableState, remote: &SyncableState) -> bool {
    match local.state_type {
        StateType::Health => {
            let local_checked = u64_field(&local.value, "last_check_ns");
            let remote_checked = u64_field(&remote.value, "last_check_ns");
            if remote_checked != local_checked {
                return remote_checked > local_checked;
            }
            if remote.version != local.version {
                return remote.version > local.version;
            }
            remote.source_node > local.source_node
        }
        StateType::CircuitBreaker => {
            let local_severity = circuit_severity(&local.value);
            let remote_severity = circuit_severity(&remote.value);
            if remote_severity != local_severity {
                return remote_severity > local_severity;
            }
            remote.version > local.version
        }
        StateType::Drain => {
            let local_draining = bool_field(&local.value, "draining");
            let remote_draining = bool_field(&remote.value, "draining");
            if remote_draining != local_draining {
                return remote_draining;
            }
            remote.version > local.version
        }
    }
}

fn u64_field(value: &serde_json::Value, field: &str) -> u64 {
    value.get(field).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn bool_field(value: &serde_json::Value, field: &str) -> bool {
    value.get(field).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn circuit_severity(value: &serde_json::Value) -> u8 {
    match value.get("phase").and_then(|v| v.as_str()) {
        Some("open") => 2,
        Some("half_open") => 1,
        _ => 0,
    }
}

/// Locally resolved view of every known (type, key) pair, plus the dirty
/// set the next gossip round pushes.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<(StateType, String), SyncableState>,
    dirty: Mutex<Vec<SyncableState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a local mutation and queue it for push gossip.
    pub fn local_update(&self, state: SyncableState) -> Result<()> {
        self.states
            .insert((state.state_type, state.key.clone()), state.clone());
        let mut dirty = self
            .dirty
            .lock()
            .map_err(|_| crate::error::LbError::Internal("state store lock poisoned".into()))?;
        dirty.retain(|s| !(s.state_type == state.state_type && s.key == state.key));
        dirty.push(state);
        Ok(())
    }

    /// Apply a remote state; returns true when it won conflict
    /// resolution and was committed.
    pub fn apply_remote(&self, remote: SyncableState) -> bool {
        let key = (remote.state_type, remote.key.clone());
        match self.states.get(&key) {
            Some(local) if !remote_wins(local.value(), &remote) => false,
            _ => {
                self.states.insert(key, remote);
                true
            }
        }
    }

    pub fn get(&self, state_type: StateType, key: &str) -> Option<SyncableState> {
        self.states
            .get(&(state_type, key.to_string()))
            .map(|s| s.value().clone())
    }

    pub fn all(&self) -> Vec<SyncableState> {
        self.states.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drain the states updated since the previous gossip round.
    pub fn take_dirty(&self) -> Vec<SyncableState> {
        match self.dirty.lock() {
            Ok(mut dirty) => std::mem::take(&mut *dirty),
            Err(_) => Vec::new(),
        }
    }

    /// Digest of known versions, keyed `"TYPE:key"`.
    pub fn digest(&self) -> HashMap<String, u64> {
        self.states
            .iter()
            .map(|e| (e.value().digest_key(), e.value().version))
            .collect()
    }

    /// States the digest's sender is missing or holds an older version
    /// of.
    pub fn missing_from(&self, digest: &HashMap<String, u64>) -> Vec<SyncableState> {
        self.states
            .iter()
            .filter(|e| {
                digest
                    .get(&e.value().digest_key())
                    .map(|v| *v < e.value().version)
                    .unwrap_or(true)
            })
            .map(|e| e.value().clone())
            .collect()
    }
}

/// Subsystem adapter: seeds the store at start and adopts remote states
/// that won conflict resolution.
pub trait StateProvider: Send + Sync {
    fn state_type(&self) -> StateType;
    /// Current local states, as (key, value) pairs.
    fn snapshot(&self) -> Vec<(String, serde_json::Value)>;
    /// Adopt a committed remote state.
    fn apply(&self, key: &str, value: &serde_json::Value) -> Result<()>;
}
