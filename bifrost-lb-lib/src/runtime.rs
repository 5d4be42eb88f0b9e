//! The control-plane service.
//!
//! Owns every subsystem, wires their events together and drives the
//! lifecycle: program the kernel maps from the configuration, run the
//! watchers, apply reloads incrementally, and shut down within a bounded
//! budget. Kernel map handles live in the [`MapSet`] and are dropped
//! last.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::accesslog::{AccessEvent, AccessEventKind, AccessLog};
use crate::circuit::{now_ns, CircuitBreaker};
use crate::cluster::{
    CircuitStateProvider, ClusterRuntime, DrainStateProvider, HealthStateProvider, StateProvider,
    StateType,
};
use crate::codec::{FLAG_PROXY_PROTOCOL_V2, FLAG_SESSION_PERSISTENCE};
use crate::config::{
    compile_proxy, validate, CompiledGroup, CompiledProxy, Config, RateLimitEntry,
};
use crate::conntrack::{Connection, ConntrackReader};
use crate::dns::{DnsResolver, Resolve, SystemResolver};
use crate::drain::{DrainCallback, DrainEngine, DrainStatus};
use crate::error::{LbError, Result};
use crate::health::HealthChecker;
use crate::maps::{MapProgrammer, MapSet, RateLimitScope, RouteKey};
use crate::reload::{diff, ConfigDiff, ReloadReport};
use crate::target::TargetGroup;
use crate::telemetry::{init_metrics, Metrics};
use crate::weights::WeightPipeline;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Interface-name to ifindex seam; the netlink-backed resolver is a
/// collaborator.
pub trait InterfaceResolver: Send + Sync {
    fn ifindex(&self, name: &str) -> Option<u32>;
}

/// Assigns stable sequential indexes, for tests and dry runs without a
/// data plane.
#[derive(Default)]
pub struct StaticInterfaceResolver {
    entries: DashMap<String, u32>,
    next: AtomicU32,
}

impl StaticInterfaceResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InterfaceResolver for StaticInterfaceResolver {
    fn ifindex(&self, name: &str) -> Option<u32> {
        let index = self
            .entries
            .entry(name.to_string())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::SeqCst) + 1);
        Some(*index)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneStatus {
    pub running: bool,
    pub proxies: usize,
    pub connections: usize,
    pub cluster_enabled: bool,
}

pub struct ControlPlane {
    config: ArcSwap<Config>,
    maps: MapSet,
    programmer: Arc<MapProgrammer>,
    pipeline: Arc<WeightPipeline>,
    conntrack: Arc<ConntrackReader>,
    health: Arc<HealthChecker>,
    circuit: Arc<CircuitBreaker>,
    drain: Arc<DrainEngine>,
    dns: Arc<DnsResolver>,
    cluster: Option<Arc<ClusterRuntime>>,
    access_log: ArcSwap<AccessLog>,
    ifaces: Arc<dyn InterfaceResolver>,
    metrics: Arc<Metrics>,
    registry: prometheus::Registry,
    tracker: TaskTracker,
    cancel: CancellationToken,
    running: AtomicBool,
    compiled: DashMap<String, CompiledProxy>,
}

impl ControlPlane {
    pub fn new(config: Config, maps: MapSet, ifaces: Arc<dyn InterfaceResolver>) -> Result<Arc<Self>> {
        Self::with_dns_backend(config, maps, ifaces, Arc::new(SystemResolver))
    }

    pub fn with_dns_backend(
        config: Config,
        maps: MapSet,
        ifaces: Arc<dyn InterfaceResolver>,
        dns_backend: Arc<dyn Resolve>,
    ) -> Result<Arc<Self>> {
        validate(&config)?;
        let (metrics, registry) = init_metrics()?;

        let programmer = Arc::new(MapProgrammer::new(maps.clone()));
        let lb = &config.settings.load_balancing;
        let pipeline = Arc::new(WeightPipeline::new(
            programmer.clone(),
            lb.algorithm,
            lb.weighted,
            Some(metrics.clone()),
        ));
        let conntrack = Arc::new(ConntrackReader::new(
            maps.conntrack.clone(),
            usize::try_from(config.settings.max_connections).unwrap_or(usize::MAX),
        ));
        let health = Arc::new(HealthChecker::new(pipeline.clone(), Some(metrics.clone())));
        let circuit = Arc::new(CircuitBreaker::new(
            config.settings.circuit_breaker.clone(),
            pipeline.clone(),
            Some(metrics.clone()),
        ));
        let drain = Arc::new(DrainEngine::new(
            conntrack.clone(),
            pipeline.clone(),
            config.settings.drain_check_interval_ms,
            config.settings.default_drain_timeout_ms,
        ));
        let dns = Arc::new(DnsResolver::new(dns_backend));

        let cluster = if config.settings.cluster.enabled {
            let providers: Vec<Arc<dyn StateProvider>> = vec![
                Arc::new(HealthStateProvider::new(health.clone())),
                Arc::new(CircuitStateProvider::new(circuit.clone())),
                Arc::new(DrainStateProvider::new(drain.clone(), pipeline.clone())),
            ];
            Some(ClusterRuntime::new(
                config.settings.cluster.clone(),
                providers,
                Some(metrics.clone()),
            ))
        } else {
            None
        };

        Ok(Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            maps,
            programmer,
            pipeline,
            conntrack,
            health,
            circuit,
            drain,
            dns,
            cluster,
            access_log: ArcSwap::from_pointee(AccessLog::disabled()),
            ifaces,
            metrics,
            registry,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            compiled: DashMap::new(),
        }))
    }

    /// The shared map handles. Owned here so they outlive every
    /// subsystem and drop last on shutdown.
    pub fn maps(&self) -> &MapSet {
        &self.maps
    }

    pub fn programmer(&self) -> &Arc<MapProgrammer> {
        &self.programmer
    }

    pub fn pipeline(&self) -> &Arc<WeightPipeline> {
        &self.pipeline
    }

    pub fn conntrack(&self) -> &Arc<ConntrackReader> {
        &self.conntrack
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn dns(&self) -> &Arc<DnsResolver> {
        &self.dns
    }

    pub fn cluster(&self) -> Result<&Arc<ClusterRuntime>> {
        self.cluster.as_ref().ok_or(LbError::ClusterNotRunning)
    }

    pub fn metrics_registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    pub fn current_config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn status(&self) -> ControlPlaneStatus {
        ControlPlaneStatus {
            running: self.is_running(),
            proxies: self.compiled.len(),
            connections: self.conntrack.count(),
            cluster_enabled: self.cluster.is_some(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(LbError::NotRunning);
        }
        Ok(())
    }

    /// Program the maps, register every subsystem and spawn the
    /// long-lived tasks. Startup failures abort.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.is_running() {
            return Err(LbError::OperationFailed("control plane already started".to_string()));
        }
        let config = self.config.load_full();

        for proxy in &config.proxies {
            let compiled = compile_proxy(proxy)?;
            self.install_proxy(&compiled).await?;
            self.compiled.insert(compiled.name.clone(), compiled);
        }
        self.apply_rate_limits(&config)?;

        self.access_log.store(Arc::new(AccessLog::start(
            &config.settings.access_log,
            &self.tracker,
            &self.cancel,
        )));

        if let Some(cluster) = &self.cluster {
            cluster.start(&self.tracker, &self.cancel).await?;
        }

        let circuit = self.circuit.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move { circuit.run_watcher(cancel).await });

        let drain = self.drain.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move { drain.run_watcher(cancel).await });

        self.dns.spawn_refresh_tasks(&self.tracker, &self.cancel);
        self.health.spawn_probes(&self.tracker, &self.cancel);

        let plane = self.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move { plane.run_health_forwarder(cancel).await });

        let plane = self.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move { plane.run_circuit_forwarder(cancel).await });

        let plane = self.clone();
        let cancel = self.cancel.clone();
        let interval = Duration::from_millis(u64::from(
            config.settings.load_balancing.update_interval_ms.max(100),
        ));
        self.tracker.spawn(async move { plane.run_conntrack_sweep(interval, cancel).await });

        self.running.store(true, Ordering::SeqCst);
        info!(proxies = config.proxies.len(), "control plane started");
        Ok(())
    }

    /// Cancel every task, fire pending drain callbacks with `Cancelled`
    /// and join within the budget. Map handles go last.
    pub async fn shutdown(&self) {
        info!("control plane shutting down");
        self.running.store(false, Ordering::SeqCst);
        self.drain.shutdown();
        self.cancel.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_BUDGET, self.tracker.wait()).await.is_err() {
            warn!("tasks did not stop within the shutdown budget");
        }
        // MapSet handles drop with the control plane itself.
        info!("control plane stopped");
    }

    /// Drain a backend out of the group serving it. The group's weights
    /// are rewritten before this returns.
    pub fn drain_backend(
        &self,
        proxy: &str,
        target_id: &str,
        timeout_ms: Option<u64>,
        on_complete: DrainCallback,
    ) -> Result<()> {
        self.ensure_running()?;
        let (_, group) = self
            .pipeline
            .find_group(proxy, target_id)
            .ok_or_else(|| LbError::NotFound(format!("target {target_id} in proxy {proxy}")))?;

        let callback = self.wrap_drain_callback(target_id, on_complete);
        self.drain.drain_backend(proxy, &group, target_id, timeout_ms, callback)?;
        self.publish_drain(target_id, true);
        Ok(())
    }

    pub fn undrain_backend(&self, target_id: &str) -> Result<()> {
        self.ensure_running()?;
        self.drain.undrain_backend(target_id)?;
        self.publish_drain(target_id, false);
        Ok(())
    }

    pub fn drains(&self) -> Vec<DrainStatus> {
        self.drain.list()
    }

    /// Validate, diff and apply a new configuration with minimal map
    /// churn.
    pub async fn reload(&self, new_config: Config) -> Result<(ConfigDiff, ReloadReport)> {
        self.ensure_running()?;
        validate(&new_config)?;

        let old_config = self.config.load_full();
        let d = diff(&old_config, &new_config);
        let mut report = ReloadReport::default();

        for name in &d.removed_proxies {
            match self.uninstall_proxy(name) {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("remove {name}: {err}"));
                }
            }
        }

        for name in &d.added_proxies {
            let Some(proxy) = new_config.proxy(name) else { continue };
            match compile_proxy(proxy) {
                Ok(compiled) => match self.install_proxy(&compiled).await {
                    Ok(()) => {
                        self.compiled.insert(name.clone(), compiled);
                        report.applied += 1;
                    }
                    Err(err) => {
                        report.failed += 1;
                        report.errors.push(format!("add {name}: {err}"));
                    }
                },
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("compile {name}: {err}"));
                }
            }
        }

        for proxy_diff in &d.modified_proxies {
            let name = &proxy_diff.name;
            let Some(proxy) = new_config.proxy(name) else { continue };
            // A listen change means a new kernel key shape: drain the old
            // listener entries and recreate. Anything else is a targeted
            // rewrite inside install_proxy (idempotent writes).
            let result = if proxy_diff.listen_changed {
                match self.uninstall_proxy(name) {
                    Ok(()) => match compile_proxy(proxy) {
                        Ok(compiled) => {
                            let r = self.install_proxy(&compiled).await;
                            if r.is_ok() {
                                self.compiled.insert(name.clone(), compiled);
                            }
                            r
                        }
                        Err(err) => Err(err),
                    },
                    Err(err) => Err(err),
                }
            } else {
                self.apply_proxy_update(name, proxy, proxy_diff).await
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(format!("modify {name}: {err}"));
                }
            }
        }

        for change in &d.settings_changes {
            match change.as_str() {
                "rate_limits" => {
                    self.apply_rate_limits(&new_config)?;
                    report.applied += 1;
                }
                // Takes effect on the next sweep/probe cycle.
                "stats_enabled" | "access_log" | "default_drain_timeout_ms"
                | "drain_check_interval_ms" | "connection_timeout_sec" => {
                    report.applied += 1;
                }
                other => {
                    debug!(setting = other, "change requires restart, skipped");
                    report.skipped += 1;
                }
            }
        }

        self.config.store(Arc::new(new_config));
        info!(
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "reload finished"
        );
        Ok((d, report))
    }

    async fn apply_proxy_update(
        &self,
        name: &str,
        proxy: &crate::config::ProxyConfig,
        proxy_diff: &crate::reload::ProxyDiff,
    ) -> Result<()> {
        let compiled = compile_proxy(proxy)?;
        let rewrite_all = proxy_diff.session_persistence_changed;

        if proxy_diff.default_target_changed || rewrite_all {
            for interface in &compiled.interfaces {
                let ifindex = self.resolve_ifindex(interface)?;
                let route = RouteKey::Listen { ifindex, port: compiled.port };
                self.install_group(
                    name,
                    route,
                    &compiled.default_group,
                    compiled.session_persistence,
                )
                .await?;
            }
        }

        for cidr in &proxy_diff.removed_source_routes {
            let net: ipnet::IpNet = cidr
                .parse()
                .map_err(|_| LbError::invalid_param("source", format!("bad CIDR {cidr}")))?;
            let route = RouteKey::Source { net };
            self.pipeline.remove_group(name, &route);
            self.programmer.remove_route(&route)?;
            self.dns.unregister_group(name, &route_label(&route));
        }
        for route in &compiled.source_routes {
            let key = RouteKey::Source { net: route.source };
            let is_new = proxy_diff
                .added_source_routes
                .iter()
                .any(|cidr| cidr == &route.source.to_string());
            if is_new || rewrite_all {
                self.install_group(name, key, &route.group, route.session_persistence).await?;
            }
        }

        for hostname in &proxy_diff.removed_sni_routes {
            let route = RouteKey::Sni { hash: crate::codec::fnv1a_hash(hostname) };
            self.pipeline.remove_group(name, &route);
            self.programmer.remove_route(&route)?;
            self.dns.unregister_group(name, &route_label(&route));
        }
        for route in &compiled.sni_routes {
            let key = RouteKey::Sni { hash: route.hostname_hash };
            let is_new = proxy_diff.added_sni_routes.contains(&route.hostname);
            if is_new || rewrite_all {
                self.install_group(name, key, &route.group, route.session_persistence).await?;
            }
        }

        self.compiled.insert(name.to_string(), compiled);
        Ok(())
    }

    async fn install_proxy(&self, compiled: &CompiledProxy) -> Result<()> {
        for interface in &compiled.interfaces {
            let ifindex = self.resolve_ifindex(interface)?;
            let route = RouteKey::Listen { ifindex, port: compiled.port };
            self.install_group(
                &compiled.name,
                route,
                &compiled.default_group,
                compiled.session_persistence,
            )
            .await?;
        }
        for route in &compiled.source_routes {
            let key = RouteKey::Source { net: route.source };
            self.install_group(&compiled.name, key, &route.group, route.session_persistence)
                .await?;
        }
        for route in &compiled.sni_routes {
            let key = RouteKey::Sni { hash: route.hostname_hash };
            self.install_group(&compiled.name, key, &route.group, route.session_persistence)
                .await?;
        }
        Ok(())
    }

    /// Resolve the group (synchronously for static members, through the
    /// DNS subsystem for host-backed ones), register its targets and
    /// push it through the pipeline.
    async fn install_group(
        &self,
        proxy: &str,
        route: RouteKey,
        group: &CompiledGroup,
        session_persistence: bool,
    ) -> Result<()> {
        let flags = route_flags(session_persistence, group.wants_proxy_v2());
        let target_group = if group.is_dns_backed() {
            let label = route_label(&route);
            let pipeline = self.pipeline.clone();
            let health = self.health.clone();
            let circuit = self.circuit.clone();
            let tracker = self.tracker.clone();
            let cancel = self.cancel.clone();
            let proxy_name = proxy.to_string();
            let cb_route = route.clone();
            self.dns.unregister_group(proxy, &label);
            self.dns
                .register_group(
                    proxy,
                    &label,
                    group,
                    Arc::new(move |new_group: TargetGroup| {
                        for target in new_group.targets() {
                            health.register(&proxy_name, target);
                            circuit.register(&target.id());
                            health.spawn_probe(target.id(), &tracker, &cancel);
                        }
                        if let Err(err) = pipeline.register_group(
                            &proxy_name,
                            cb_route.clone(),
                            new_group,
                            flags,
                        ) {
                            error!(proxy = %proxy_name, %err, "resolved group not applied");
                        }
                    }),
                )
                .await?
        } else {
            TargetGroup::new(group.static_targets.clone())?
        };

        for target in target_group.targets() {
            self.health.register(proxy, target);
            self.circuit.register(&target.id());
            if self.is_running() {
                self.health.spawn_probe(target.id(), &self.tracker, &self.cancel);
            }
        }
        self.pipeline.register_group(proxy, route, target_group, flags)?;
        Ok(())
    }

    fn uninstall_proxy(&self, name: &str) -> Result<()> {
        if self.compiled.remove(name).is_none() {
            return Err(LbError::NotFound(format!("proxy {name}")));
        }
        let target_ids = self.pipeline.proxy_target_ids(name);
        for route in self.pipeline.proxy_routes(name) {
            self.pipeline.remove_group(name, &route);
            self.programmer.remove_route(&route)?;
            self.dns.unregister_group(name, &route_label(&route));
        }
        // Targets removed mid-drain get their drains cancelled.
        for id in target_ids {
            if self.drain.is_draining(&id) {
                let _ = self.drain.cancel(&id);
            }
            self.health.unregister(&id);
            self.circuit.unregister(&id);
            self.pipeline.forget_target(&id);
        }
        info!(proxy = name, "proxy uninstalled");
        Ok(())
    }

    fn apply_rate_limits(&self, config: &Config) -> Result<()> {
        let limits = &config.settings.rate_limits;
        self.apply_rate_limit(RateLimitScope::PerSource, limits.per_source.as_ref())?;
        self.apply_rate_limit(RateLimitScope::PerBackend, limits.per_backend.as_ref())?;
        Ok(())
    }

    fn apply_rate_limit(
        &self,
        scope: RateLimitScope,
        entry: Option<&RateLimitEntry>,
    ) -> Result<()> {
        match entry {
            Some(limit) => {
                self.programmer
                    .set_rate_limit(scope, limit.requests_per_sec, limit.burst_or_rate())
            }
            None => self.programmer.disable_rate_limit(scope).map(|_| ()),
        }
    }

    fn resolve_ifindex(&self, interface: &str) -> Result<u32> {
        self.ifaces.ifindex(interface).ok_or_else(|| {
            LbError::invalid_param("interface", format!("unknown interface {interface:?}"))
        })
    }

    fn wrap_drain_callback(&self, target_id: &str, inner: DrainCallback) -> DrainCallback {
        let cluster = self.cluster.clone();
        let target = target_id.to_string();
        Box::new(move |outcome| {
            if let Some(cluster) = &cluster {
                let _ = cluster.publish(
                    StateType::Drain,
                    &target,
                    serde_json::json!({ "draining": false }),
                );
            }
            inner(outcome);
        })
    }

    fn publish_drain(&self, target_id: &str, draining: bool) {
        if let Some(cluster) = &self.cluster {
            if let Err(err) = cluster.publish(
                StateType::Drain,
                target_id,
                serde_json::json!({ "draining": draining }),
            ) {
                warn!(%err, "drain state not published");
            }
        }
    }

    /// Forward every health result into the circuit breaker in receipt
    /// order, and publish transitions to the cluster.
    async fn run_health_forwarder(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.health.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    let Ok(event) = event else { continue };
                    if let Err(err) = self.circuit.record(&event.target_id, event.success) {
                        warn!(target = %event.target_id, %err, "circuit observation failed");
                    }
                    if let Some(cluster) = &self.cluster {
                        if let Some(status) = self.health.status(&event.target_id) {
                            if let Ok(value) = serde_json::to_value(status) {
                                let _ = cluster.publish(StateType::Health, &event.target_id, value);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_circuit_forwarder(self: Arc<Self>, cancel: CancellationToken) {
        let mut events = self.circuit.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => {
                    let Ok(event) = event else { continue };
                    let Some(cluster) = &self.cluster else { continue };
                    if let Some(status) = self.circuit.status(&event.target_id) {
                        if let Ok(value) = serde_json::to_value(status) {
                            let _ = cluster.publish(
                                StateType::CircuitBreaker,
                                &event.target_id,
                                value,
                            );
                        }
                    }
                }
            }
        }
    }

    /// Periodic conntrack ingestion: connection counts into the weight
    /// pipeline, open/close events into the access log.
    async fn run_conntrack_sweep(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        let mut previous: HashMap<ConnKey, Connection> = HashMap::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let mut counts: HashMap<String, u64> = HashMap::new();
            let mut current: HashMap<ConnKey, Connection> = HashMap::new();
            for conn in self.conntrack.get_all() {
                *counts.entry(target_key(conn.nat_dst.0, conn.nat_dst.1)).or_insert(0) += 1;
                current.insert(ConnKey::of(&conn), conn);
            }
            if let Err(err) = self.pipeline.set_connection_counts(&counts) {
                warn!(%err, "connection counts not applied");
            }

            let log = self.access_log.load_full();
            if log.is_enabled() {
                for (key, conn) in &current {
                    if !previous.contains_key(key) {
                        log.log(self.access_event(conn, AccessEventKind::Opened));
                    }
                }
                for (key, conn) in &previous {
                    if !current.contains_key(key) {
                        log.log(self.access_event(conn, AccessEventKind::Closed));
                    }
                }
            }
            previous = current;
        }
    }

    fn access_event(&self, conn: &Connection, kind: AccessEventKind) -> AccessEvent {
        let config = self.config.load_full();
        let proxy = config
            .proxies
            .iter()
            .find(|p| p.listen.port == conn.orig_dst.1)
            .map(|p| p.name.clone());
        AccessEvent {
            timestamp_ns: now_ns(),
            event: kind,
            proxy,
            client: target_key(conn.src_ip, conn.src_port),
            orig_dst: target_key(conn.orig_dst.0, conn.orig_dst.1),
            backend: target_key(conn.nat_dst.0, conn.nat_dst.1),
            protocol: conn.protocol,
            bytes_fwd: conn.bytes_fwd,
            bytes_rev: conn.bytes_rev,
            packets_fwd: u64::from(conn.packets_fwd),
            packets_rev: u64::from(conn.packets_rev),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnKey {
    src: (IpAddr, u16),
    dst: (IpAddr, u16),
    protocol: u8,
}

impl ConnKey {
    fn of(conn: &Connection) -> Self {
        Self {
            src: (conn.src_ip, conn.src_port),
            dst: (conn.dst_ip, conn.dst_port),
            protocol: conn.protocol,
        }
    }
}

fn route_flags(session_persistence: bool, proxy_v2: bool) -> u16 {
    let mut flags = 0u16;
    if session_persistence {
        flags |= FLAG_SESSION_PERSISTENCE;
    }
    if proxy_v2 {
        flags |= FLAG_PROXY_PROTOCOL_V2;
    }
    flags
}

fn route_label(route: &RouteKey) -> String {
    match route {
        RouteKey::Listen { ifindex, port } => format!("listen:{ifindex}:{port}"),
        RouteKey::Source { net } => format!("src:{net}"),
        RouteKey::Sni { hash } => format!("sni:{hash:016x}"),
    }
}

fn target_key(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(v4) => format!("{v4}:{port}"),
        IpAddr::V6(v6) => format!("[{v6}]:{port}"),
    }
}
