//! Configuration diffing for incremental reloads.
//!
//! The control plane walks the diff and issues the minimal sequence of
//! map mutations: a listen change drains and recreates the listener, a
//! default-target change rewrites one weighted route, route changes
//! touch only their own entries.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::config::{Config, ProxyConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigDiff {
    pub added_proxies: Vec<String>,
    pub removed_proxies: Vec<String>,
    pub modified_proxies: Vec<ProxyDiff>,
    /// Names of top-level settings sections that changed
    pub settings_changes: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        self.added_proxies.is_empty()
            && self.removed_proxies.is_empty()
            && self.modified_proxies.is_empty()
            && self.settings_changes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProxyDiff {
    pub name: String,
    pub listen_changed: bool,
    pub default_target_changed: bool,
    pub added_source_routes: Vec<String>,
    pub removed_source_routes: Vec<String>,
    pub added_sni_routes: Vec<String>,
    pub removed_sni_routes: Vec<String>,
    pub session_persistence_changed: bool,
}

impl ProxyDiff {
    fn is_empty(&self) -> bool {
        !self.listen_changed
            && !self.default_target_changed
            && self.added_source_routes.is_empty()
            && self.removed_source_routes.is_empty()
            && self.added_sni_routes.is_empty()
            && self.removed_sni_routes.is_empty()
            && !self.session_persistence_changed
    }
}

/// Result of applying a reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

pub fn diff(old: &Config, new: &Config) -> ConfigDiff {
    let old_names: BTreeSet<&str> = old.proxies.iter().map(|p| p.name.as_str()).collect();
    let new_names: BTreeSet<&str> = new.proxies.iter().map(|p| p.name.as_str()).collect();

    let added_proxies: Vec<String> =
        new_names.difference(&old_names).map(|n| n.to_string()).collect();
    let removed_proxies: Vec<String> =
        old_names.difference(&new_names).map(|n| n.to_string()).collect();

    let mut modified_proxies = Vec::new();
    for name in old_names.intersection(&new_names) {
        let (Some(old_proxy), Some(new_proxy)) = (old.proxy(name), new.proxy(name)) else {
            continue;
        };
        let proxy_diff = diff_proxy(old_proxy, new_proxy);
        if !proxy_diff.is_empty() {
            modified_proxies.push(proxy_diff);
        }
    }

    ConfigDiff {
        added_proxies,
        removed_proxies,
        modified_proxies,
        settings_changes: diff_settings(old, new),
    }
}

fn diff_proxy(old: &ProxyConfig, new: &ProxyConfig) -> ProxyDiff {
    let mut d = ProxyDiff { name: old.name.clone(), ..ProxyDiff::default() };
    d.listen_changed = old.listen != new.listen;
    d.default_target_changed = old.default_target != new.default_target;
    d.session_persistence_changed = old.session_persistence != new.session_persistence;

    // A route with the same CIDR/hostname but different targets shows up
    // as removed + added; the applier rewrites its entry.
    for route in &old.source_routes {
        if !new.source_routes.contains(route) {
            d.removed_source_routes.push(route.source.clone());
        }
    }
    for route in &new.source_routes {
        if !old.source_routes.contains(route) {
            d.added_source_routes.push(route.source.clone());
        }
    }
    for route in &old.sni_routes {
        if !new.sni_routes.contains(route) {
            d.removed_sni_routes.push(route.sni_hostname.to_ascii_lowercase());
        }
    }
    for route in &new.sni_routes {
        if !old.sni_routes.contains(route) {
            d.added_sni_routes.push(route.sni_hostname.to_ascii_lowercase());
        }
    }
    d
}

fn diff_settings(old: &Config, new: &Config) -> Vec<String> {
    let mut changes = Vec::new();
    let (o, n) = (&old.settings, &new.settings);
    if o.stats_enabled != n.stats_enabled {
        changes.push("stats_enabled".to_string());
    }
    if o.connection_timeout_sec != n.connection_timeout_sec {
        changes.push("connection_timeout_sec".to_string());
    }
    if o.max_connections != n.max_connections {
        changes.push("max_connections".to_string());
    }
    if o.default_drain_timeout_ms != n.default_drain_timeout_ms {
        changes.push("default_drain_timeout_ms".to_string());
    }
    if o.drain_check_interval_ms != n.drain_check_interval_ms {
        changes.push("drain_check_interval_ms".to_string());
    }
    if o.rate_limits != n.rate_limits {
        changes.push("rate_limits".to_string());
    }
    if o.load_balancing != n.load_balancing {
        changes.push("load_balancing".to_string());
    }
    if o.circuit_breaker != n.circuit_breaker {
        changes.push("circuit_breaker".to_string());
    }
    if o.cluster != n.cluster {
        changes.push("cluster".to_string());
    }
    if o.access_log != n.access_log {
        changes.push("access_log".to_string());
    }
    changes
}
