use std::collections::BTreeSet;

use serde::Deserialize;

/// Root configuration: the set of proxies plus global settings.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Proxies, each with a unique name
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

impl Config {
    pub fn proxy(&self, name: &str) -> Option<&ProxyConfig> {
        self.proxies.iter().find(|p| p.name == name)
    }
}

/// One listener with its default target group and routing rules.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ProxyConfig {
    /// Unique proxy name
    pub name: String,
    /// Interfaces and port the kernel program accepts traffic on
    pub listen: ListenConfig,
    /// Default target group when no source or SNI route matches.
    /// A single target or a list; weights of a list must sum to 100.
    pub default_target: OneOrMany<TargetSpec>,
    /// Source-CIDR routes, matched by longest prefix
    #[serde(default)]
    pub source_routes: Vec<SourceRouteConfig>,
    /// TLS ClientHello SNI routes (hostname matched in kernel space by hash)
    #[serde(default)]
    pub sni_routes: Vec<SniRouteConfig>,
    /// Stick clients to the backend picked for their first connection
    #[serde(default)]
    pub session_persistence: bool,
}

/// Where a proxy listens.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ListenConfig {
    /// Interface names the XDP program attaches to (e.g. ["eth0"])
    pub interfaces: BTreeSet<String>,
    /// Listen port, 1..=65535
    pub port: u16,
}

/// A backend endpoint spec. Exactly one of `ip` or `host` is set; a
/// `host` entry is DNS-backed and re-resolved periodically.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TargetSpec {
    /// Literal IPv4/IPv6 address
    #[serde(default)]
    pub ip: Option<String>,
    /// Hostname to resolve (mutually exclusive with `ip`)
    #[serde(default)]
    pub host: Option<String>,
    /// Backend port
    pub port: u16,
    /// Weight share in 1..=100. A multi-target group must sum to 100
    /// explicitly; a single target defaults to 100
    #[serde(default = "default_weight")]
    pub weight: u8,
    /// Set to "v2" to inject a PROXY protocol v2 header toward this backend
    #[serde(default)]
    pub proxy_protocol: Option<String>,
    /// Re-resolution interval for `host` entries
    /// Default: 30 seconds
    #[serde(default = "default_dns_refresh_seconds")]
    pub dns_refresh_seconds: u64,
    /// Active health check for this target (optional)
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl TargetSpec {
    pub fn wants_proxy_v2(&self) -> bool {
        self.proxy_protocol.as_deref() == Some("v2")
    }
}

/// `target = {..}` or `targets = [..]` sugar shared by route configs.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(t) => vec![t.clone()],
            OneOrMany::Many(v) => v.clone(),
        }
    }
}

/// Route selecting a target group by client source CIDR.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceRouteConfig {
    /// Source CIDR, v4 or v6 (e.g. "10.0.0.0/8")
    pub source: String,
    /// Single target
    #[serde(default)]
    pub target: Option<TargetSpec>,
    /// Target list; weights must sum to 100
    #[serde(default)]
    pub targets: Option<Vec<TargetSpec>>,
    /// Override the proxy-level session persistence for this route
    #[serde(default)]
    pub session_persistence: Option<bool>,
}

impl SourceRouteConfig {
    pub fn target_specs(&self) -> Vec<TargetSpec> {
        match (&self.target, &self.targets) {
            (Some(t), _) => vec![t.clone()],
            (None, Some(list)) => list.clone(),
            (None, None) => Vec::new(),
        }
    }
}

/// Route selecting a target group by TLS ClientHello SNI hostname.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SniRouteConfig {
    /// Hostname to match; compared case-insensitively
    pub sni_hostname: String,
    #[serde(default)]
    pub target: Option<TargetSpec>,
    #[serde(default)]
    pub targets: Option<Vec<TargetSpec>>,
    #[serde(default)]
    pub session_persistence: Option<bool>,
}

impl SniRouteConfig {
    pub fn target_specs(&self) -> Vec<TargetSpec> {
        match (&self.target, &self.targets) {
            (Some(t), _) => vec![t.clone()],
            (None, Some(list)) => list.clone(),
            (None, None) => Vec::new(),
        }
    }
}

/// Active health check configuration for one target.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct HealthCheckConfig {
    /// Probe type
    #[serde(default)]
    pub kind: HealthCheckKind,
    /// Probe interval
    /// Default: 5 seconds
    #[serde(default = "default_health_interval_sec")]
    pub interval_sec: u64,
    /// Per-probe timeout
    /// Default: 2 seconds
    #[serde(default = "default_health_timeout_sec")]
    pub timeout_sec: u64,
    /// Consecutive successes before UNKNOWN/UNHEALTHY becomes HEALTHY
    /// Default: 2
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
    /// Consecutive failures before HEALTHY becomes UNHEALTHY
    /// Default: 3
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
    /// Request path for `http` probes (expects a 2xx)
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Command line for `command` probes; exit 0 means healthy
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            kind: HealthCheckKind::Tcp,
            interval_sec: default_health_interval_sec(),
            timeout_sec: default_health_timeout_sec(),
            healthy_threshold: default_healthy_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            path: default_health_path(),
            command: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckKind {
    #[default]
    Tcp,
    Http,
    Command,
}

/// Global settings.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    /// Collect per-connection stats from the conntrack map
    #[serde(default)]
    pub stats_enabled: bool,
    /// Idle timeout after which the kernel expires a conntrack entry
    /// Range 1..=86400, default 300
    #[serde(default = "default_connection_timeout_sec")]
    pub connection_timeout_sec: u64,
    /// Conntrack map capacity
    /// Range 1..=10_000_000, default 100_000
    #[serde(default = "default_max_connections")]
    pub max_connections: u64,
    /// Drain timeout when none is given per call
    /// Range 1_000..=3_600_000, default 30_000
    #[serde(default = "default_drain_timeout_ms")]
    pub default_drain_timeout_ms: u64,
    /// Drain watcher wake interval
    /// Range 100..=60_000, default 1000
    #[serde(default = "default_drain_check_interval_ms")]
    pub drain_check_interval_ms: u64,
    /// Kernel-enforced rate limits
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    /// Backend selection algorithm and weight pipeline cadence
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    /// Per-target circuit breaker policy
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Cluster state synchronization
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Connection access log
    #[serde(default)]
    pub access_log: AccessLogConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            stats_enabled: false,
            connection_timeout_sec: default_connection_timeout_sec(),
            max_connections: default_max_connections(),
            default_drain_timeout_ms: default_drain_timeout_ms(),
            drain_check_interval_ms: default_drain_check_interval_ms(),
            rate_limits: RateLimitsConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cluster: ClusterConfig::default(),
            access_log: AccessLogConfig::default(),
        }
    }
}

/// Rate limit scopes written to the kernel config maps.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct RateLimitsConfig {
    /// Per client source address
    #[serde(default)]
    pub per_source: Option<RateLimitEntry>,
    /// Per backend target
    #[serde(default)]
    pub per_backend: Option<RateLimitEntry>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub requests_per_sec: u32,
    /// Burst allowance; defaults to `requests_per_sec`
    #[serde(default)]
    pub burst: Option<u32>,
}

impl RateLimitEntry {
    pub fn burst_or_rate(&self) -> u32 {
        self.burst.unwrap_or(self.requests_per_sec)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    WeightedRandom,
    LeastConnections,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub algorithm: LoadBalancingAlgorithm,
    /// `least_connections` only: scale scores by configured weights
    /// (weighted mode) instead of connection counts alone
    #[serde(default = "default_true")]
    pub weighted: bool,
    /// Connection-count refresh cadence for the weight pipeline
    #[serde(default = "default_lb_update_interval_ms")]
    pub update_interval_ms: u32,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: LoadBalancingAlgorithm::WeightedRandom,
            weighted: true,
            update_interval_ms: default_lb_update_interval_ms(),
        }
    }
}

/// Circuit-breaker policy applied to every target.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Error percentage at which the circuit opens
    /// Default: 50
    #[serde(default = "default_error_threshold_pct")]
    pub error_threshold_pct: u8,
    /// Minimum observations in the window before the threshold applies
    /// Default: 5
    #[serde(default = "default_min_requests")]
    pub min_requests: u32,
    /// Time spent OPEN before probing resumes
    /// Default: 30_000
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,
    /// Consecutive half-open successes required to close
    /// Default: 3
    #[serde(default = "default_half_open_requests")]
    pub half_open_requests: u32,
    /// Rolling window length while CLOSED
    /// Default: 10_000
    #[serde(default = "default_window_size_ms")]
    pub window_size_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_threshold_pct: default_error_threshold_pct(),
            min_requests: default_min_requests(),
            open_duration_ms: default_open_duration_ms(),
            half_open_requests: default_half_open_requests(),
            window_size_ms: default_window_size_ms(),
        }
    }
}

/// Gossip cluster configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Node identity; defaults to `bind_address:bind_port`
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Peer addresses to join through, `host:port`
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Default: 200
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
    /// Alive peers addressed per gossip round
    /// Default: 3
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,
    /// Anti-entropy full-state exchange cadence
    /// Default: 30_000
    #[serde(default = "default_push_pull_interval_ms")]
    pub push_pull_interval_ms: u64,
    /// Default: 1000
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Default: 500
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Peers asked to probe indirectly on direct-ping timeout
    /// Default: 2
    #[serde(default = "default_ping_req_count")]
    pub ping_req_count: usize,
    /// SUSPECT becomes DEAD after `suspicion_mult * ping_interval_ms`
    /// Default: 4
    #[serde(default = "default_suspicion_mult")]
    pub suspicion_mult: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            bind_address: default_bind_address(),
            bind_port: default_bind_port(),
            seeds: Vec::new(),
            gossip_interval_ms: default_gossip_interval_ms(),
            gossip_fanout: default_gossip_fanout(),
            push_pull_interval_ms: default_push_pull_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_req_count: default_ping_req_count(),
            suspicion_mult: default_suspicion_mult(),
        }
    }
}

impl ClusterConfig {
    pub fn effective_node_id(&self) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.bind_address, self.bind_port))
    }
}

/// Connection access log sink.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccessLogConfig {
    #[serde(default)]
    pub enabled: bool,
    /// File path; absent means stdout
    #[serde(default)]
    pub path: Option<String>,
    /// Rotate after this many megabytes
    /// Default: 100
    #[serde(default = "default_access_log_max_size_mb")]
    pub max_size_mb: u64,
    /// Rotated files kept (suffixes .1..n)
    /// Default: 10
    #[serde(default = "default_access_log_max_files")]
    pub max_files: usize,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: None,
            max_size_mb: default_access_log_max_size_mb(),
            max_files: default_access_log_max_files(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u8 {
    100
}

fn default_dns_refresh_seconds() -> u64 {
    30
}

fn default_health_interval_sec() -> u64 {
    5
}

fn default_health_timeout_sec() -> u64 {
    2
}

fn default_healthy_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_health_path() -> String {
    "/".to_string()
}

fn default_connection_timeout_sec() -> u64 {
    300
}

fn default_max_connections() -> u64 {
    100_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

fn default_drain_check_interval_ms() -> u64 {
    1000
}

fn default_lb_update_interval_ms() -> u32 {
    1000
}

fn default_error_threshold_pct() -> u8 {
    50
}

fn default_min_requests() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

fn default_half_open_requests() -> u32 {
    3
}

fn default_window_size_ms() -> u64 {
    10_000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    7946
}

fn default_gossip_interval_ms() -> u64 {
    200
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_push_pull_interval_ms() -> u64 {
    30_000
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_ping_timeout_ms() -> u64 {
    500
}

fn default_ping_req_count() -> usize {
    2
}

fn default_suspicion_mult() -> u64 {
    4
}

fn default_access_log_max_size_mb() -> u64 {
    100
}

fn default_access_log_max_files() -> usize {
    10
}
