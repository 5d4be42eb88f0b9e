//! Turns raw config sections into the parsed, partitioned form the rest
//! of the control plane consumes: addresses parsed, DNS-backed entries
//! split out, SNI hostnames canonicalized and hashed.

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use super::types::{ProxyConfig, SniRouteConfig, SourceRouteConfig, TargetSpec};
use crate::codec::fnv1a_hash;
use crate::error::{LbError, Result};
use crate::target::{DnsHost, Target, MAX_GROUP_TARGETS};

/// A target group spec with the DNS-backed part split from the static
/// part. `hosts` is non-empty for DNS-backed groups; the resolver merges
/// resolved addresses back in at refresh time.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGroup {
    pub static_targets: Vec<Target>,
    pub hosts: Vec<DnsHost>,
}

impl CompiledGroup {
    pub fn is_dns_backed(&self) -> bool {
        !self.hosts.is_empty()
    }

    /// Route-level PROXY v2 flag: set when any member asks for injection.
    pub fn wants_proxy_v2(&self) -> bool {
        self.static_targets.iter().any(|t| t.proxy_protocol_v2)
            || self.hosts.iter().any(|h| h.proxy_protocol_v2)
    }

    fn from_specs(specs: &[TargetSpec], context: &str) -> Result<Self> {
        if specs.is_empty() {
            return Err(LbError::invalid_param(context, "at least one target is required"));
        }
        if specs.len() > MAX_GROUP_TARGETS {
            return Err(LbError::invalid_param(
                context,
                format!("at most {MAX_GROUP_TARGETS} targets per group, got {}", specs.len()),
            ));
        }
        if specs.len() > 1 {
            let sum: u32 = specs.iter().map(|s| u32::from(s.weight)).sum();
            if sum != 100 {
                return Err(LbError::invalid_param(
                    context,
                    format!("target weights must sum to 100, got {sum}"),
                ));
            }
        }

        let mut static_targets = Vec::new();
        let mut hosts = Vec::new();
        let mut seen_addrs = HashSet::new();
        let mut seen_hosts = HashSet::new();
        for spec in specs {
            if spec.port == 0 {
                return Err(LbError::invalid_param(context, "target port must be non-zero"));
            }
            if spec.weight == 0 || spec.weight > 100 {
                return Err(LbError::invalid_param(
                    context,
                    format!("target weight must be in 1..=100, got {}", spec.weight),
                ));
            }
            if let Some(pp) = &spec.proxy_protocol {
                if pp != "v2" {
                    return Err(LbError::invalid_param(
                        context,
                        format!("unsupported proxy_protocol {pp:?}, only \"v2\""),
                    ));
                }
            }
            match (&spec.ip, &spec.host) {
                (Some(ip), None) => {
                    let address: IpAddr = ip.parse().map_err(|_| {
                        LbError::invalid_param(context, format!("invalid target ip {ip:?}"))
                    })?;
                    if !seen_addrs.insert((address, spec.port)) {
                        return Err(LbError::OperationFailed(format!(
                            "{context}: duplicate target {ip}:{}",
                            spec.port
                        )));
                    }
                    static_targets.push(Target {
                        address,
                        port: spec.port,
                        weight: spec.weight,
                        proxy_protocol_v2: spec.wants_proxy_v2(),
                        health_check: spec.health_check.clone(),
                    });
                }
                (None, Some(host)) => {
                    let host = host.to_ascii_lowercase();
                    if !seen_hosts.insert((host.clone(), spec.port)) {
                        return Err(LbError::OperationFailed(format!(
                            "{context}: duplicate host {host}:{}",
                            spec.port
                        )));
                    }
                    hosts.push(DnsHost {
                        hostname: host,
                        port: spec.port,
                        weight: spec.weight,
                        proxy_protocol_v2: spec.wants_proxy_v2(),
                        refresh_seconds: spec.dns_refresh_seconds,
                        health_check: spec.health_check.clone(),
                    });
                }
                (Some(_), Some(_)) => {
                    return Err(LbError::invalid_param(
                        context,
                        "a target sets either ip or host, not both",
                    ))
                }
                (None, None) => {
                    return Err(LbError::MissingParam("ip or host"));
                }
            }
        }
        Ok(Self { static_targets, hosts })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSourceRoute {
    pub source: IpNet,
    pub group: CompiledGroup,
    pub session_persistence: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledSniRoute {
    /// Lower-cased hostname
    pub hostname: String,
    pub hostname_hash: u64,
    pub group: CompiledGroup,
    pub session_persistence: bool,
}

/// Fully parsed proxy ready for map programming and subsystem
/// registration.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledProxy {
    pub name: String,
    pub interfaces: Vec<String>,
    pub port: u16,
    pub session_persistence: bool,
    pub default_group: CompiledGroup,
    pub source_routes: Vec<CompiledSourceRoute>,
    pub sni_routes: Vec<CompiledSniRoute>,
}

pub fn compile_proxy(proxy: &ProxyConfig) -> Result<CompiledProxy> {
    if proxy.name.trim().is_empty() {
        return Err(LbError::MissingParam("proxy name"));
    }
    if proxy.listen.port == 0 {
        return Err(LbError::invalid_param(
            format!("proxy {}", proxy.name),
            "listen port must be in 1..=65535",
        ));
    }
    if proxy.listen.interfaces.is_empty() {
        return Err(LbError::invalid_param(
            format!("proxy {}", proxy.name),
            "at least one listen interface is required",
        ));
    }

    let default_group = CompiledGroup::from_specs(
        &proxy.default_target.to_vec(),
        &format!("proxy {} default_target", proxy.name),
    )?;

    let mut source_routes = Vec::with_capacity(proxy.source_routes.len());
    let mut seen_sources = HashSet::new();
    for route in &proxy.source_routes {
        source_routes.push(compile_source_route(proxy, route, &mut seen_sources)?);
    }

    let mut sni_routes = Vec::with_capacity(proxy.sni_routes.len());
    let mut seen_hostnames = HashSet::new();
    for route in &proxy.sni_routes {
        sni_routes.push(compile_sni_route(proxy, route, &mut seen_hostnames)?);
    }

    Ok(CompiledProxy {
        name: proxy.name.clone(),
        interfaces: proxy.listen.interfaces.iter().cloned().collect(),
        port: proxy.listen.port,
        session_persistence: proxy.session_persistence,
        default_group,
        source_routes,
        sni_routes,
    })
}

fn compile_source_route(
    proxy: &ProxyConfig,
    route: &SourceRouteConfig,
    seen: &mut HashSet<IpNet>,
) -> Result<CompiledSourceRoute> {
    let context = format!("proxy {} source_route {}", proxy.name, route.source);
    let source: IpNet = route
        .source
        .parse()
        .map_err(|_| {
            LbError::invalid_param(context.as_str(), format!("invalid CIDR {:?}", route.source))
        })?;
    if !seen.insert(source) {
        return Err(LbError::OperationFailed(format!("{context}: duplicate source CIDR")));
    }
    let group = CompiledGroup::from_specs(&route.target_specs(), &context)?;
    Ok(CompiledSourceRoute {
        source,
        group,
        session_persistence: route.session_persistence.unwrap_or(proxy.session_persistence),
    })
}

fn compile_sni_route(
    proxy: &ProxyConfig,
    route: &SniRouteConfig,
    seen: &mut HashSet<String>,
) -> Result<CompiledSniRoute> {
    let hostname = route.sni_hostname.trim().to_ascii_lowercase();
    let context = format!("proxy {} sni_route {hostname}", proxy.name);
    if hostname.is_empty() {
        return Err(LbError::MissingParam("sni_hostname"));
    }
    if !seen.insert(hostname.clone()) {
        return Err(LbError::OperationFailed(format!("{context}: duplicate SNI hostname")));
    }
    let group = CompiledGroup::from_specs(&route.target_specs(), &context)?;
    Ok(CompiledSniRoute {
        hostname_hash: fnv1a_hash(&hostname),
        hostname,
        group,
        session_persistence: route.session_persistence.unwrap_or(proxy.session_persistence),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ListenConfig, OneOrMany};

    fn spec(ip: &str, port: u16, weight: u8) -> TargetSpec {
        TargetSpec {
            ip: Some(ip.to_string()),
            host: None,
            port,
            weight,
            proxy_protocol: None,
            dns_refresh_seconds: 30,
            health_check: None,
        }
    }

    fn proxy_with_defaults(targets: Vec<TargetSpec>) -> ProxyConfig {
        ProxyConfig {
            name: "web".to_string(),
            listen: ListenConfig { interfaces: ["eth0".to_string()].into(), port: 443 },
            default_target: OneOrMany::Many(targets),
            source_routes: Vec::new(),
            sni_routes: Vec::new(),
            session_persistence: false,
        }
    }

    #[test]
    fn partitions_static_and_dns() {
        let mut host_spec = spec("10.0.0.1", 8080, 50);
        host_spec.ip = None;
        host_spec.host = Some("API.Example.com".to_string());
        let proxy = proxy_with_defaults(vec![spec("10.0.0.2", 8080, 50), host_spec]);
        let compiled = compile_proxy(&proxy).unwrap();
        assert_eq!(compiled.default_group.static_targets.len(), 1);
        assert_eq!(compiled.default_group.hosts.len(), 1);
        // Hostnames are canonicalized to lower case at compile time.
        assert_eq!(compiled.default_group.hosts[0].hostname, "api.example.com");
    }

    #[test]
    fn rejects_weight_sum_mismatch() {
        let proxy = proxy_with_defaults(vec![spec("10.0.0.1", 80, 60), spec("10.0.0.2", 80, 60)]);
        let err = compile_proxy(&proxy).unwrap_err();
        assert_eq!(err.kind(), "INVALID_PARAM");
    }

    #[test]
    fn rejects_duplicate_sni_hostname() {
        let mut proxy = proxy_with_defaults(vec![spec("10.0.0.1", 80, 100)]);
        let route = SniRouteConfig {
            sni_hostname: "App.example.com".to_string(),
            target: Some(spec("10.0.0.2", 80, 100)),
            targets: None,
            session_persistence: None,
        };
        let mut dup = route.clone();
        dup.sni_hostname = "app.EXAMPLE.com".to_string();
        proxy.sni_routes = vec![route, dup];
        let err = compile_proxy(&proxy).unwrap_err();
        assert_eq!(err.kind(), "OPERATION_FAILED");
    }

    #[test]
    fn route_proxy_v2_flag_follows_members() {
        let mut with_pp = spec("10.0.0.1", 80, 100);
        with_pp.proxy_protocol = Some("v2".to_string());
        let proxy = proxy_with_defaults(vec![with_pp]);
        let compiled = compile_proxy(&proxy).unwrap();
        assert!(compiled.default_group.wants_proxy_v2());
    }
}
