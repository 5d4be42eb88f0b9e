//! Periodic DNS re-resolution for host-backed targets.
//!
//! Each registered group runs one refresh task per hostname. A changed
//! address set (compared by membership, not order) rebuilds the group,
//! spreading the hostname's weight share evenly across the resolved
//! addresses with the remainder on the last, and invokes the
//! registration callback.
//! Resolution failures after startup keep the last-known-good set.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::lookup_host;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::CompiledGroup;
use crate::error::{LbError, Result};
use crate::target::{distribute_weight, DnsHost, Target, TargetGroup, MAX_GROUP_TARGETS};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Name resolution seam; tests substitute an in-memory implementation.
pub trait Resolve: Send + Sync {
    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<IpAddr>>> + Send + 'a>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve<'a>(
        &'a self,
        hostname: &'a str,
        port: u16,
    ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<IpAddr>>> + Send + 'a>> {
        Box::pin(async move {
            let addrs = lookup_host((hostname, port)).await?;
            Ok(addrs.map(|a| a.ip()).collect())
        })
    }
}

pub type DnsChangeCallback = Arc<dyn Fn(TargetGroup) + Send + Sync>;

/// Admin view of one hostname binding.
#[derive(Debug, Clone, Serialize)]
pub struct DnsBindingInfo {
    pub proxy: String,
    pub group: String,
    pub hostname: String,
    pub refresh_seconds: u64,
    pub resolved: Vec<IpAddr>,
    pub consecutive_failures: u32,
}

struct RegState {
    resolved: HashMap<String, Vec<IpAddr>>,
    failures: HashMap<String, u32>,
}

struct Registration {
    proxy: String,
    label: String,
    static_targets: Vec<Target>,
    hosts: Vec<DnsHost>,
    callback: DnsChangeCallback,
    state: Mutex<RegState>,
}

impl Registration {
    /// Rebuild the group from static targets plus every hostname's
    /// last-known addresses.
    fn build_group(&self, state: &RegState) -> Result<TargetGroup> {
        let mut targets = self.static_targets.clone();
        for host in &self.hosts {
            let Some(ips) = state.resolved.get(&host.hostname) else {
                continue;
            };
            // Every expanded member needs a non-zero share, and the group
            // is capped at the kernel record count.
            let room = MAX_GROUP_TARGETS.saturating_sub(targets.len());
            let usable = ips.len().min(usize::from(host.weight)).min(room);
            if usable < ips.len() {
                warn!(
                    hostname = %host.hostname,
                    resolved = ips.len(),
                    usable,
                    "truncating resolved address set"
                );
            }
            if usable == 0 {
                continue;
            }
            let shares = distribute_weight(host.weight, usable);
            for (ip, share) in ips.iter().take(usable).zip(shares) {
                targets.push(Target {
                    address: *ip,
                    port: host.port,
                    weight: share,
                    proxy_protocol_v2: host.proxy_protocol_v2,
                    health_check: host.health_check.clone(),
                });
            }
        }
        TargetGroup::new(targets).map_err(Into::into)
    }
}

pub struct DnsResolver {
    resolver: Arc<dyn Resolve>,
    registrations: DashMap<String, Arc<Registration>>,
}

impl DnsResolver {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver, registrations: DashMap::new() }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemResolver))
    }

    /// Register a DNS-backed group and resolve every hostname once. A
    /// startup failure aborts the registration. Returns the initial
    /// group; later changes arrive through `callback`.
    pub async fn register_group(
        &self,
        proxy: &str,
        label: &str,
        group: &CompiledGroup,
        callback: DnsChangeCallback,
    ) -> Result<TargetGroup> {
        let mut resolved = HashMap::new();
        for host in &group.hosts {
            let ips = self.resolve_once(&host.hostname, host.port).await.map_err(|e| {
                LbError::DnsStartupFailure { hostname: host.hostname.clone(), reason: e }
            })?;
            info!(proxy, hostname = %host.hostname, addresses = ips.len(), "initial resolution");
            resolved.insert(host.hostname.clone(), ips);
        }

        let registration = Arc::new(Registration {
            proxy: proxy.to_string(),
            label: label.to_string(),
            static_targets: group.static_targets.clone(),
            hosts: group.hosts.clone(),
            callback,
            state: Mutex::new(RegState { resolved, failures: HashMap::new() }),
        });
        let initial = {
            let state = lock(&registration.state)?;
            registration.build_group(&state)?
        };
        self.registrations.insert(reg_key(proxy, label), registration);
        Ok(initial)
    }

    pub fn unregister_group(&self, proxy: &str, label: &str) -> bool {
        self.registrations.remove(&reg_key(proxy, label)).is_some()
    }

    pub fn bindings(&self) -> Vec<DnsBindingInfo> {
        let mut out = Vec::new();
        for entry in self.registrations.iter() {
            let reg = entry.value();
            let Ok(state) = lock(&reg.state) else { continue };
            for host in &reg.hosts {
                out.push(DnsBindingInfo {
                    proxy: reg.proxy.clone(),
                    group: reg.label.clone(),
                    hostname: host.hostname.clone(),
                    refresh_seconds: host.refresh_seconds,
                    resolved: state.resolved.get(&host.hostname).cloned().unwrap_or_default(),
                    consecutive_failures: state
                        .failures
                        .get(&host.hostname)
                        .copied()
                        .unwrap_or(0),
                });
            }
        }
        out
    }

    /// Out-of-schedule refresh for every binding of `hostname`. Returns
    /// how many bindings were refreshed.
    pub async fn force_resolve(&self, hostname: &str) -> Result<usize> {
        let regs: Vec<Arc<Registration>> = self
            .registrations
            .iter()
            .filter(|e| e.value().hosts.iter().any(|h| h.hostname == hostname))
            .map(|e| e.value().clone())
            .collect();
        if regs.is_empty() {
            return Err(LbError::NotFound(format!("hostname {hostname}")));
        }
        for reg in &regs {
            if let Some(host) = reg.hosts.iter().find(|h| h.hostname == hostname) {
                self.refresh(reg, host).await;
            }
        }
        Ok(regs.len())
    }

    /// Spawn the per-hostname refresh loops for every registration.
    pub fn spawn_refresh_tasks(
        self: &Arc<Self>,
        tracker: &TaskTracker,
        cancel: &CancellationToken,
    ) {
        for entry in self.registrations.iter() {
            let reg = entry.value().clone();
            for host in reg.hosts.clone() {
                let resolver = self.clone();
                let reg = reg.clone();
                let cancel = cancel.clone();
                tracker.spawn(async move {
                    resolver.refresh_loop(reg, host, cancel).await;
                });
            }
        }
    }

    async fn refresh_loop(&self, reg: Arc<Registration>, host: DnsHost, cancel: CancellationToken) {
        let interval = Duration::from_secs(host.refresh_seconds.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            if !self.registrations.contains_key(&reg_key(&reg.proxy, &reg.label)) {
                debug!(proxy = %reg.proxy, hostname = %host.hostname, "refresh loop stopped");
                return;
            }
            self.refresh(&reg, &host).await;
        }
    }

    /// One refresh pass for a single hostname of a registration.
    async fn refresh(&self, reg: &Arc<Registration>, host: &DnsHost) {
        match self.resolve_once(&host.hostname, host.port).await {
            Ok(ips) => {
                let rebuilt = {
                    let Ok(mut state) = lock(&reg.state) else { return };
                    state.failures.insert(host.hostname.clone(), 0);
                    let previous: HashSet<IpAddr> = state
                        .resolved
                        .get(&host.hostname)
                        .map(|v| v.iter().copied().collect())
                        .unwrap_or_default();
                    let current: HashSet<IpAddr> = ips.iter().copied().collect();
                    if previous == current {
                        None
                    } else {
                        info!(
                            hostname = %host.hostname,
                            previous = previous.len(),
                            current = current.len(),
                            "address set changed"
                        );
                        state.resolved.insert(host.hostname.clone(), ips);
                        match reg.build_group(&state) {
                            Ok(group) => Some(group),
                            Err(err) => {
                                warn!(hostname = %host.hostname, %err, "rebuilt group invalid, keeping previous");
                                None
                            }
                        }
                    }
                };
                // Callback runs outside the state lock; it must not block.
                if let Some(group) = rebuilt {
                    (reg.callback)(group);
                }
            }
            Err(reason) => {
                let Ok(mut state) = lock(&reg.state) else { return };
                let failures = state.failures.entry(host.hostname.clone()).or_insert(0);
                *failures += 1;
                warn!(
                    hostname = %host.hostname,
                    consecutive_failures = *failures,
                    %reason,
                    "resolution failed, keeping last-known-good set"
                );
            }
        }
    }

    async fn resolve_once(&self, hostname: &str, port: u16) -> std::result::Result<Vec<IpAddr>, String> {
        match tokio::time::timeout(RESOLVE_TIMEOUT, self.resolver.resolve(hostname, port)).await {
            Ok(Ok(ips)) if !ips.is_empty() => {
                let mut unique = Vec::new();
                for ip in ips {
                    if !unique.contains(&ip) {
                        unique.push(ip);
                    }
                }
                Ok(unique)
            }
            Ok(Ok(_)) => Err("no addresses returned".to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("resolution timed out".to_string()),
        }
    }
}

fn reg_key(proxy: &str, label: &str) -> String {
    format!("{proxy}/{label}")
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| LbError::Internal("dns registration lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticResolver {
        answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl StaticResolver {
        fn new() -> Self {
            Self { answers: Mutex::new(HashMap::new()) }
        }

        fn set(&self, hostname: &str, ips: Vec<IpAddr>) {
            self.answers.lock().unwrap().insert(hostname.to_string(), ips);
        }
    }

    impl Resolve for StaticResolver {
        fn resolve<'a>(
            &'a self,
            hostname: &'a str,
            _port: u16,
        ) -> Pin<Box<dyn Future<Output = std::io::Result<Vec<IpAddr>>> + Send + 'a>> {
            let result = self
                .answers
                .lock()
                .unwrap()
                .get(hostname)
                .cloned()
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no answer"));
            Box::pin(async move { result })
        }
    }

    fn dns_group(hostname: &str) -> CompiledGroup {
        CompiledGroup {
            static_targets: Vec::new(),
            hosts: vec![DnsHost {
                hostname: hostname.to_string(),
                port: 8080,
                weight: 100,
                proxy_protocol_v2: false,
                refresh_seconds: 30,
                health_check: None,
            }],
        }
    }

    #[tokio::test]
    async fn initial_resolution_expands_weight() {
        let backend = Arc::new(StaticResolver::new());
        backend.set("api.example", vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()]);
        let resolver = DnsResolver::new(backend);

        let group = resolver
            .register_group("web", "default", &dns_group("api.example"), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.targets()[0].weight, 50);
        assert_eq!(group.targets()[1].weight, 50);
    }

    #[tokio::test]
    async fn startup_failure_aborts_registration() {
        let backend = Arc::new(StaticResolver::new());
        let resolver = DnsResolver::new(backend);
        let err = resolver
            .register_group("web", "default", &dns_group("missing.example"), Arc::new(|_| {}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DNS_STARTUP_FAILURE");
    }

    #[tokio::test]
    async fn change_fires_callback_with_rebuilt_group() {
        let backend = Arc::new(StaticResolver::new());
        backend.set("api.example", vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()]);
        let resolver = DnsResolver::new(backend.clone());

        let seen: Arc<Mutex<Vec<TargetGroup>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        resolver
            .register_group(
                "web",
                "default",
                &dns_group("api.example"),
                Arc::new(move |group| {
                    seen_cb.lock().unwrap().push(group);
                }),
            )
            .await
            .unwrap();

        // Same membership, different order: no callback.
        backend.set("api.example", vec!["10.0.0.2".parse().unwrap(), "10.0.0.1".parse().unwrap()]);
        resolver.force_resolve("api.example").await.unwrap();
        assert!(seen.lock().unwrap().is_empty());

        // Replaced member: callback with the new pair.
        backend.set("api.example", vec!["10.0.0.1".parse().unwrap(), "10.0.0.3".parse().unwrap()]);
        resolver.force_resolve("api.example").await.unwrap();
        let groups = seen.lock().unwrap();
        assert_eq!(groups.len(), 1);
        let ids: Vec<String> = groups[0].targets().iter().map(|t| t.id()).collect();
        assert!(ids.contains(&"10.0.0.1:8080".to_string()));
        assert!(ids.contains(&"10.0.0.3:8080".to_string()));
        assert_eq!(groups[0].targets()[0].weight, 50);
    }

    #[tokio::test]
    async fn runtime_failure_keeps_last_known_good() {
        let backend = Arc::new(StaticResolver::new());
        backend.set("api.example", vec!["10.0.0.1".parse().unwrap()]);
        let resolver = DnsResolver::new(backend.clone());
        resolver
            .register_group("web", "default", &dns_group("api.example"), Arc::new(|_| {}))
            .await
            .unwrap();

        backend.answers.lock().unwrap().remove("api.example");
        resolver.force_resolve("api.example").await.unwrap();
        let bindings = resolver.bindings();
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].consecutive_failures, 1);
        assert_eq!(bindings[0].resolved, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
