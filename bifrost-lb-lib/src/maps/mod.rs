//! Kernel map access seam.
//!
//! The eBPF loader is a collaborator; the control plane only sees maps
//! through [`MapHandle`], keyed and valued by the raw byte layouts in
//! [`crate::codec`]. [`MemoryMap`] is the in-process implementation used
//! by tests and by dry runs without a data plane.

mod programmer;

pub use programmer::{MapProgrammer, RateLimitScope, RouteKey};

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::Result;

/// Raw byte view of one kernel map.
pub trait MapHandle: Send + Sync {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()>;
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;
    /// Returns whether an entry was present.
    fn delete(&self, key: &[u8]) -> Result<bool>;
    fn iterate(&self) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// Hash-map backed [`MapHandle`].
#[derive(Default)]
pub struct MemoryMap {
    entries: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn MapHandle> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MapHandle for MemoryMap {
    fn insert(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.entries.insert(key, value);
        Ok(())
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn iterate(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// The maps the data plane shares with the control plane.
#[derive(Clone)]
pub struct MapSet {
    /// (ifindex, port, af_tag) -> weighted route
    pub listen: Arc<dyn MapHandle>,
    /// LPM (prefix_len, ip) -> weighted route
    pub source_lpm: Arc<dyn MapHandle>,
    /// SNI hash -> weighted route
    pub sni: Arc<dyn MapHandle>,
    /// Client 5-tuple -> connection entry, written by the kernel path
    pub conntrack: Arc<dyn MapHandle>,
    /// Rate-limit scope -> {rate, burst}
    pub rate_limit: Arc<dyn MapHandle>,
}

impl MapSet {
    pub fn in_memory() -> Self {
        Self {
            listen: MemoryMap::shared(),
            source_lpm: MemoryMap::shared(),
            sni: MemoryMap::shared(),
            conntrack: MemoryMap::shared(),
            rate_limit: MemoryMap::shared(),
        }
    }
}
