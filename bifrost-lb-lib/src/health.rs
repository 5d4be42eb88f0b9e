//! Active health checking.
//!
//! Each registered target gets its own probe loop. Every result emits an
//! event (the circuit breaker consumes these) and updates consecutive
//! counters; threshold crossings flip the target's status and feed the
//! weight pipeline. UNKNOWN still routes; only a confirmed UNHEALTHY
//! masks a target.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::circuit::now_ns;
use crate::config::{HealthCheckConfig, HealthCheckKind};
use crate::error::{LbError, Result};
use crate::target::Target;
use crate::telemetry::Metrics;
use crate::weights::WeightPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }

    /// Whether the weight pipeline should route to a target in this
    /// state.
    pub fn routable(&self) -> bool {
        !matches!(self, HealthState::Unhealthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub status: HealthState,
    pub last_check_ns: u64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl HealthStatus {
    fn new() -> Self {
        Self {
            status: HealthState::Unknown,
            last_check_ns: 0,
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }
}

/// One probe result.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthEvent {
    pub target_id: String,
    pub proxy: String,
    pub success: bool,
    pub latency_seconds: f64,
}

struct TargetEntry {
    proxy: String,
    address: IpAddr,
    port: u16,
    config: HealthCheckConfig,
    status: HealthStatus,
}

pub struct HealthChecker {
    pipeline: Arc<WeightPipeline>,
    metrics: Option<Arc<Metrics>>,
    events: broadcast::Sender<HealthEvent>,
    targets: DashMap<String, TargetEntry>,
    active_probes: DashMap<String, ()>,
}

impl HealthChecker {
    pub fn new(pipeline: Arc<WeightPipeline>, metrics: Option<Arc<Metrics>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            pipeline,
            metrics,
            events,
            targets: DashMap::new(),
            active_probes: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Track a target. Without a health-check config this is a no-op;
    /// such targets route unconditionally.
    pub fn register(&self, proxy: &str, target: &Target) {
        let Some(config) = target.health_check.clone() else {
            return;
        };
        self.targets.entry(target.id()).or_insert_with(|| TargetEntry {
            proxy: proxy.to_string(),
            address: target.address,
            port: target.port,
            config,
            status: HealthStatus::new(),
        });
    }

    pub fn unregister(&self, target_id: &str) -> bool {
        self.targets.remove(target_id).is_some()
    }

    pub fn status(&self, target_id: &str) -> Option<HealthStatus> {
        self.targets.get(target_id).map(|e| e.value().status.clone())
    }

    pub fn list(&self) -> Vec<(String, HealthStatus)> {
        self.targets
            .iter()
            .map(|e| (e.key().clone(), e.value().status.clone()))
            .collect()
    }

    /// Apply one probe result. Public so tests and the probe loops share
    /// the same path.
    pub fn record_result(&self, target_id: &str, success: bool, latency_seconds: f64) -> Result<()> {
        let (proxy, transition) = {
            let Some(mut entry) = self.targets.get_mut(target_id) else {
                return Err(LbError::NotFound(format!("health target {target_id}")));
            };
            let e = entry.value_mut();
            e.status.last_check_ns = now_ns();
            if success {
                e.status.consecutive_successes += 1;
                e.status.consecutive_failures = 0;
            } else {
                e.status.consecutive_failures += 1;
                e.status.consecutive_successes = 0;
            }
            let next = match e.status.status {
                HealthState::Healthy
                    if e.status.consecutive_failures >= e.config.unhealthy_threshold =>
                {
                    Some(HealthState::Unhealthy)
                }
                HealthState::Unknown | HealthState::Unhealthy
                    if e.status.consecutive_successes >= e.config.healthy_threshold =>
                {
                    Some(HealthState::Healthy)
                }
                HealthState::Unknown
                    if e.status.consecutive_failures >= e.config.unhealthy_threshold =>
                {
                    Some(HealthState::Unhealthy)
                }
                _ => None,
            };
            if let Some(next) = next {
                e.status.status = next;
            }
            (e.proxy.clone(), next)
        };

        if let Some(metrics) = &self.metrics {
            metrics
                .health_check_duration_seconds
                .with_label_values(&[&proxy, target_id])
                .observe(latency_seconds);
            metrics
                .health_checks_total
                .with_label_values(&[target_id, if success { "success" } else { "failure" }])
                .inc();
        }

        if let Some(next) = transition {
            info!(target = target_id, status = next.as_str(), "health transition");
            self.pipeline.set_health(target_id, next.routable())?;
        }

        let _ = self.events.send(HealthEvent {
            target_id: target_id.to_string(),
            proxy,
            success,
            latency_seconds,
        });
        Ok(())
    }

    /// Adopt a status decided by a cluster peer.
    pub fn apply_status(&self, target_id: &str, status: HealthStatus) -> Result<()> {
        let changed = {
            let Some(mut entry) = self.targets.get_mut(target_id) else {
                return Err(LbError::NotFound(format!("health target {target_id}")));
            };
            let changed = entry.value().status.status != status.status;
            entry.value_mut().status = status.clone();
            changed
        };
        if changed {
            debug!(target = target_id, status = status.status.as_str(), "health adopted from peer");
            self.pipeline.set_health(target_id, status.status.routable())?;
        }
        Ok(())
    }

    /// Spawn one probe loop per currently registered target. The loop
    /// exits when its target is unregistered or on cancellation.
    pub fn spawn_probes(self: &Arc<Self>, tracker: &TaskTracker, cancel: &CancellationToken) {
        for entry in self.targets.iter() {
            self.spawn_probe(entry.key().clone(), tracker, cancel);
        }
    }

    /// Idempotent per target: a second call while a loop is already
    /// running is a no-op.
    pub fn spawn_probe(
        self: &Arc<Self>,
        target_id: String,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) {
        if !self.targets.contains_key(&target_id) {
            return;
        }
        if self.active_probes.insert(target_id.clone(), ()).is_some() {
            return;
        }
        let checker = self.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            checker.probe_loop(target_id.clone(), cancel).await;
            checker.active_probes.remove(&target_id);
        });
    }

    async fn probe_loop(&self, target_id: String, cancel: CancellationToken) {
        loop {
            let Some((address, port, config)) = self
                .targets
                .get(&target_id)
                .map(|e| (e.value().address, e.value().port, e.value().config.clone()))
            else {
                debug!(target = %target_id, "probe loop stopped, target unregistered");
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(config.interval_sec)) => {}
            }
            let started = Instant::now();
            let success = probe(address, port, &config).await;
            let latency = started.elapsed().as_secs_f64();
            if let Err(err) = self.record_result(&target_id, success, latency) {
                // Unregistered between probe and record; the next loop
                // iteration exits.
                debug!(target = %target_id, %err, "probe result dropped");
            }
        }
    }
}

async fn probe(address: IpAddr, port: u16, config: &HealthCheckConfig) -> bool {
    let timeout = Duration::from_secs(config.timeout_sec);
    match config.kind {
        HealthCheckKind::Tcp => probe_tcp(address, port, timeout).await,
        HealthCheckKind::Http => probe_http(address, port, &config.path, timeout).await,
        HealthCheckKind::Command => probe_command(config.command.as_deref(), timeout).await,
    }
}

async fn probe_tcp(address: IpAddr, port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::new(address, port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Minimal HTTP/1.1 GET expecting a 2xx status line. The backend sees a
/// plain socket request; no client stack is involved.
async fn probe_http(address: IpAddr, port: u16, path: &str, timeout: Duration) -> bool {
    let addr = SocketAddr::new(address, port);
    let result = tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: {address}\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await?;
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await?;
        Ok::<bool, std::io::Error>(is_2xx_status_line(&buf[..n]))
    })
    .await;
    matches!(result, Ok(Ok(true)))
}

async fn probe_command(command: Option<&str>, timeout: Duration) -> bool {
    let Some(command) = command else {
        warn!("command probe without a command configured");
        return false;
    };
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh").arg("-c").arg(command).status(),
    )
    .await;
    matches!(result, Ok(Ok(status)) if status.success())
}

fn is_2xx_status_line(buf: &[u8]) -> bool {
    // "HTTP/1.1 2xx ..."
    let Some(line) = buf.split(|b| *b == b'\r').next() else {
        return false;
    };
    let mut parts = line.split(|b| *b == b' ');
    match (parts.next(), parts.next()) {
        (Some(version), Some(status)) => {
            version.starts_with(b"HTTP/") && status.first() == Some(&b'2') && status.len() == 3
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancingAlgorithm;
    use crate::maps::{MapProgrammer, MapSet, RouteKey};
    use crate::target::TargetGroup;

    fn checker() -> (Arc<HealthChecker>, Arc<WeightPipeline>) {
        let programmer = Arc::new(MapProgrammer::new(MapSet::in_memory()));
        let pipeline = Arc::new(WeightPipeline::new(
            programmer,
            LoadBalancingAlgorithm::WeightedRandom,
            true,
            None,
        ));
        (Arc::new(HealthChecker::new(pipeline.clone(), None)), pipeline)
    }

    fn checked_target(ip: &str, weight: u8) -> Target {
        let mut t = Target::new(ip.parse().unwrap(), 8080, weight);
        t.health_check = Some(HealthCheckConfig::default());
        t
    }

    #[test]
    fn becomes_healthy_after_threshold() {
        let (checker, _) = checker();
        checker.register("web", &checked_target("10.0.0.1", 100));
        checker.record_result("10.0.0.1:8080", true, 0.001).unwrap();
        assert_eq!(checker.status("10.0.0.1:8080").unwrap().status, HealthState::Unknown);
        checker.record_result("10.0.0.1:8080", true, 0.001).unwrap();
        assert_eq!(checker.status("10.0.0.1:8080").unwrap().status, HealthState::Healthy);
    }

    #[test]
    fn becomes_unhealthy_after_threshold_and_recovers() {
        let (checker, pipeline) = checker();
        let targets = vec![checked_target("10.0.0.1", 50), checked_target("10.0.0.2", 50)];
        let group = TargetGroup::new(targets.clone()).unwrap();
        let route = RouteKey::Listen { ifindex: 1, port: 80 };
        pipeline.register_group("web", route.clone(), group, 0).unwrap();
        for t in &targets {
            checker.register("web", t);
        }

        for _ in 0..3 {
            checker.record_result("10.0.0.2:8080", false, 0.001).unwrap();
        }
        assert_eq!(checker.status("10.0.0.2:8080").unwrap().status, HealthState::Unhealthy);
        assert_eq!(pipeline.effective_weights("web", &route), Some(vec![100, 0]));

        for _ in 0..2 {
            checker.record_result("10.0.0.2:8080", true, 0.001).unwrap();
        }
        assert_eq!(checker.status("10.0.0.2:8080").unwrap().status, HealthState::Healthy);
        assert_eq!(pipeline.effective_weights("web", &route), Some(vec![50, 50]));
    }

    #[test]
    fn consecutive_counters_reset_on_flip() {
        let (checker, _) = checker();
        checker.register("web", &checked_target("10.0.0.1", 100));
        checker.record_result("10.0.0.1:8080", false, 0.001).unwrap();
        checker.record_result("10.0.0.1:8080", true, 0.001).unwrap();
        let status = checker.status("10.0.0.1:8080").unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.consecutive_successes, 1);
    }

    #[test]
    fn every_result_is_broadcast() {
        let (checker, _) = checker();
        checker.register("web", &checked_target("10.0.0.1", 100));
        let mut rx = checker.subscribe();
        checker.record_result("10.0.0.1:8080", false, 0.002).unwrap();
        let event = rx.try_recv().unwrap();
        assert_eq!(event.target_id, "10.0.0.1:8080");
        assert!(!event.success);
    }

    #[test]
    fn status_line_parsing() {
        assert!(is_2xx_status_line(b"HTTP/1.1 200 OK\r\n"));
        assert!(is_2xx_status_line(b"HTTP/1.0 204 No Content\r\n"));
        assert!(!is_2xx_status_line(b"HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(!is_2xx_status_line(b"garbage"));
    }

    #[test]
    fn unchecked_target_not_registered() {
        let (checker, _) = checker();
        checker.register("web", &Target::new("10.0.0.1".parse().unwrap(), 8080, 100));
        assert!(checker.status("10.0.0.1:8080").is_none());
    }
}
