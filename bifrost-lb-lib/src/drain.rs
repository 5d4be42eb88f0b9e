//! Graceful backend drain.
//!
//! A drained target is zeroed in the weight pipeline before
//! [`DrainEngine::drain_backend`] returns; existing connections bleed off
//! on their own. One shared watcher re-reads connection counts and fires
//! each drain's callback exactly once: completed, timed out, or
//! cancelled.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit::now_ns;
use crate::conntrack::ConntrackReader;
use crate::error::{LbError, Result};
use crate::target::TargetGroup;
use crate::weights::WeightPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    Completed,
    TimedOut,
    Cancelled,
}

pub type DrainCallback = Box<dyn FnOnce(DrainOutcome) + Send + Sync>;

/// Snapshot of an active drain for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct DrainStatus {
    pub target_id: String,
    pub proxy_name: String,
    pub started_at_ns: u64,
    pub timeout_ms: u64,
    pub original_weight: u8,
    pub initial_conn_count: u64,
    pub current_conn_count: u64,
}

struct DrainEntry {
    proxy_name: String,
    address: IpAddr,
    port: u16,
    started: Instant,
    started_at_ns: u64,
    timeout_ms: u64,
    original_weight: u8,
    initial_conn_count: u64,
    current_conn_count: u64,
    callback: Option<DrainCallback>,
}

pub struct DrainEngine {
    conntrack: Arc<ConntrackReader>,
    pipeline: Arc<WeightPipeline>,
    check_interval: Duration,
    default_timeout_ms: u64,
    drains: DashMap<String, DrainEntry>,
}

impl DrainEngine {
    pub fn new(
        conntrack: Arc<ConntrackReader>,
        pipeline: Arc<WeightPipeline>,
        check_interval_ms: u64,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            conntrack,
            pipeline,
            check_interval: Duration::from_millis(check_interval_ms),
            default_timeout_ms,
            drains: DashMap::new(),
        }
    }

    /// Start draining `target_id` out of `group`. The weight update that
    /// zeroes the target reaches the kernel before this returns.
    pub fn drain_backend(
        &self,
        proxy_name: &str,
        group: &TargetGroup,
        target_id: &str,
        timeout_ms: Option<u64>,
        on_complete: DrainCallback,
    ) -> Result<()> {
        let target = group
            .targets()
            .iter()
            .find(|t| t.id() == target_id)
            .ok_or_else(|| LbError::NotFound(format!("target {target_id}")))?;
        if self.drains.contains_key(target_id) {
            return Err(LbError::OperationFailed(format!("target {target_id} already draining")));
        }

        let initial = self.conntrack.count_for_target(target.address, target.port) as u64;
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        self.drains.insert(
            target_id.to_string(),
            DrainEntry {
                proxy_name: proxy_name.to_string(),
                address: target.address,
                port: target.port,
                started: Instant::now(),
                started_at_ns: now_ns(),
                timeout_ms,
                original_weight: target.weight,
                initial_conn_count: initial,
                current_conn_count: initial,
                callback: Some(on_complete),
            },
        );

        // Kernel stops steering new connections at the target before the
        // caller observes the drain as started.
        if let Err(err) = self.pipeline.set_draining(target_id, true) {
            self.drains.remove(target_id);
            return Err(err);
        }
        info!(proxy = proxy_name, target = target_id, initial, timeout_ms, "drain started");
        Ok(())
    }

    /// Abort a drain and restore the target's weight. The completion
    /// callback never fires.
    pub fn undrain_backend(&self, target_id: &str) -> Result<()> {
        let Some((_, entry)) = self.drains.remove(target_id) else {
            return Err(LbError::NotFound(format!("drain {target_id}")));
        };
        drop(entry.callback);
        self.pipeline.set_draining(target_id, false)?;
        info!(proxy = %entry.proxy_name, target = target_id, "drain aborted");
        Ok(())
    }

    /// Cancel a drain whose target no longer exists (e.g. removed by a
    /// reload mid-drain). The callback fires with `Cancelled`.
    pub fn cancel(&self, target_id: &str) -> Result<()> {
        let Some((_, mut entry)) = self.drains.remove(target_id) else {
            return Err(LbError::NotFound(format!("drain {target_id}")));
        };
        self.pipeline.set_draining(target_id, false)?;
        warn!(proxy = %entry.proxy_name, target = target_id, "drain cancelled");
        if let Some(cb) = entry.callback.take() {
            cb(DrainOutcome::Cancelled);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<DrainStatus> {
        self.drains
            .iter()
            .map(|e| DrainStatus {
                target_id: e.key().clone(),
                proxy_name: e.value().proxy_name.clone(),
                started_at_ns: e.value().started_at_ns,
                timeout_ms: e.value().timeout_ms,
                original_weight: e.value().original_weight,
                initial_conn_count: e.value().initial_conn_count,
                current_conn_count: e.value().current_conn_count,
            })
            .collect()
    }

    pub fn is_draining(&self, target_id: &str) -> bool {
        self.drains.contains_key(target_id)
    }

    /// One watcher pass: refresh counts, finish drains that hit zero or
    /// ran out of time. Returns the finished targets and their outcomes.
    pub fn tick(&self) -> Vec<(String, DrainOutcome)> {
        let mut finished = Vec::new();
        for mut entry in self.drains.iter_mut() {
            let e = entry.value_mut();
            let current = self.conntrack.count_for_target(e.address, e.port) as u64;
            e.current_conn_count = current;
            if current == 0 {
                finished.push((entry.key().clone(), DrainOutcome::Completed));
            } else if e.started.elapsed() >= Duration::from_millis(e.timeout_ms) {
                finished.push((entry.key().clone(), DrainOutcome::TimedOut));
            }
        }
        for (target_id, outcome) in &finished {
            if let Some((_, mut entry)) = self.drains.remove(target_id) {
                info!(target = %target_id, outcome = ?outcome, "drain finished");
                if let Some(cb) = entry.callback.take() {
                    cb(*outcome);
                }
            }
        }
        finished
    }

    /// Cancel every active drain; callbacks fire with `Cancelled`.
    pub fn shutdown(&self) {
        let targets: Vec<String> = self.drains.iter().map(|e| e.key().clone()).collect();
        for target_id in targets {
            if let Some((_, mut entry)) = self.drains.remove(&target_id) {
                let _ = self.pipeline.set_draining(&target_id, false);
                if let Some(cb) = entry.callback.take() {
                    cb(DrainOutcome::Cancelled);
                }
            }
        }
    }

    pub async fn run_watcher(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("drain watcher stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}
