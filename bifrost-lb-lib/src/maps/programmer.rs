//! Materializes routing state into the kernel maps.
//!
//! All mutations here are idempotent: reapplying identical content is a
//! no-op, which lets reconfiguration and the weight pipeline call in
//! without diffing first. Every write is serialized through this type;
//! no other subsystem mutates the shared maps.

use bytes::BufMut;
use ipnet::IpNet;
use tracing::{debug, info};

use super::MapSet;
use crate::codec::{
    fnv1a_hash, ListenKey, LpmKey, SniKey, WeightedRouteValue, AF_TAG_V4, AF_TAG_V6,
};
use crate::error::Result;

/// Which kernel entry a weighted route is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteKey {
    Listen { ifindex: u32, port: u16 },
    Source { net: IpNet },
    Sni { hash: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    PerSource,
    PerBackend,
}

impl RateLimitScope {
    fn key(self) -> Vec<u8> {
        let id: u32 = match self {
            RateLimitScope::PerSource => 0,
            RateLimitScope::PerBackend => 1,
        };
        id.to_le_bytes().to_vec()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitScope::PerSource => "per_source",
            RateLimitScope::PerBackend => "per_backend",
        }
    }
}

pub struct MapProgrammer {
    maps: MapSet,
}

impl MapProgrammer {
    pub fn new(maps: MapSet) -> Self {
        Self { maps }
    }

    pub fn maps(&self) -> &MapSet {
        &self.maps
    }

    /// Program a listen entry for both address families.
    pub fn add_listen_port(
        &self,
        ifindex: u32,
        port: u16,
        route: &WeightedRouteValue,
    ) -> Result<()> {
        let value = route.encode();
        for af_tag in [AF_TAG_V4, AF_TAG_V6] {
            let key = ListenKey { ifindex, port, af_tag }.encode();
            if self.maps.listen.lookup(&key).as_deref() != Some(value.as_slice()) {
                self.maps.listen.insert(key, value.clone())?;
            }
        }
        info!(ifindex, port, targets = route.targets.len(), "listen entry programmed");
        Ok(())
    }

    pub fn remove_listen_port(&self, ifindex: u32, port: u16) -> Result<bool> {
        let mut removed = false;
        for af_tag in [AF_TAG_V4, AF_TAG_V6] {
            let key = ListenKey { ifindex, port, af_tag }.encode();
            removed |= self.maps.listen.delete(&key)?;
        }
        if removed {
            info!(ifindex, port, "listen entry removed");
        }
        Ok(removed)
    }

    pub fn list_listen_ports(&self) -> Result<Vec<(ListenKey, WeightedRouteValue)>> {
        let mut out = Vec::new();
        for (k, v) in self.maps.listen.iterate() {
            out.push((ListenKey::decode(&k)?, WeightedRouteValue::decode(&v)?));
        }
        Ok(out)
    }

    pub fn add_source_route(&self, net: &IpNet, route: &WeightedRouteValue) -> Result<()> {
        let key = LpmKey::from_net(net).encode();
        let value = route.encode();
        if self.maps.source_lpm.lookup(&key).as_deref() == Some(value.as_slice()) {
            debug!(%net, "source route unchanged");
            return Ok(());
        }
        self.maps.source_lpm.insert(key, value)?;
        info!(%net, targets = route.targets.len(), "source route programmed");
        Ok(())
    }

    pub fn remove_source_route(&self, net: &IpNet) -> Result<bool> {
        let removed = self.maps.source_lpm.delete(&LpmKey::from_net(net).encode())?;
        if removed {
            info!(%net, "source route removed");
        }
        Ok(removed)
    }

    pub fn list_source_routes(&self) -> Result<Vec<(LpmKey, WeightedRouteValue)>> {
        let mut out = Vec::new();
        for (k, v) in self.maps.source_lpm.iterate() {
            out.push((LpmKey::decode(&k)?, WeightedRouteValue::decode(&v)?));
        }
        Ok(out)
    }

    pub fn add_sni_route(&self, hostname: &str, route: &WeightedRouteValue) -> Result<()> {
        let key = SniKey::from_hostname(hostname).encode();
        let value = route.encode();
        if self.maps.sni.lookup(&key).as_deref() == Some(value.as_slice()) {
            debug!(hostname, "sni route unchanged");
            return Ok(());
        }
        self.maps.sni.insert(key, value)?;
        info!(hostname, hash = fnv1a_hash(hostname), "sni route programmed");
        Ok(())
    }

    pub fn remove_sni_route(&self, hostname: &str) -> Result<bool> {
        let removed = self.maps.sni.delete(&SniKey::from_hostname(hostname).encode())?;
        if removed {
            info!(hostname, "sni route removed");
        }
        Ok(removed)
    }

    pub fn list_sni_routes(&self) -> Result<Vec<(SniKey, WeightedRouteValue)>> {
        let mut out = Vec::new();
        for (k, v) in self.maps.sni.iterate() {
            out.push((SniKey::decode(&k)?, WeightedRouteValue::decode(&v)?));
        }
        Ok(out)
    }

    /// Write a weighted route wherever `key` points. Returns whether the
    /// kernel map actually changed.
    pub fn write_route(&self, key: &RouteKey, route: &WeightedRouteValue) -> Result<bool> {
        let value = route.encode();
        match key {
            RouteKey::Listen { ifindex, port } => {
                let mut changed = false;
                for af_tag in [AF_TAG_V4, AF_TAG_V6] {
                    let k = ListenKey { ifindex: *ifindex, port: *port, af_tag }.encode();
                    if self.maps.listen.lookup(&k).as_deref() != Some(value.as_slice()) {
                        self.maps.listen.insert(k, value.clone())?;
                        changed = true;
                    }
                }
                Ok(changed)
            }
            RouteKey::Source { net } => {
                let k = LpmKey::from_net(net).encode();
                if self.maps.source_lpm.lookup(&k).as_deref() == Some(value.as_slice()) {
                    return Ok(false);
                }
                self.maps.source_lpm.insert(k, value)?;
                Ok(true)
            }
            RouteKey::Sni { hash } => {
                let k = SniKey { hostname_hash: *hash }.encode();
                if self.maps.sni.lookup(&k).as_deref() == Some(value.as_slice()) {
                    return Ok(false);
                }
                self.maps.sni.insert(k, value)?;
                Ok(true)
            }
        }
    }

    pub fn remove_route(&self, key: &RouteKey) -> Result<bool> {
        match key {
            RouteKey::Listen { ifindex, port } => self.remove_listen_port(*ifindex, *port),
            RouteKey::Source { net } => self.remove_source_route(net),
            RouteKey::Sni { hash } => {
                self.maps.sni.delete(&SniKey { hostname_hash: *hash }.encode())
            }
        }
    }

    pub fn set_rate_limit(&self, scope: RateLimitScope, rate: u32, burst: u32) -> Result<()> {
        let mut value = Vec::with_capacity(8);
        value.put_u32_le(rate);
        value.put_u32_le(burst);
        let key = scope.key();
        if self.maps.rate_limit.lookup(&key).as_deref() == Some(value.as_slice()) {
            return Ok(());
        }
        self.maps.rate_limit.insert(key, value)?;
        info!(scope = scope.as_str(), rate, burst, "rate limit set");
        Ok(())
    }

    pub fn disable_rate_limit(&self, scope: RateLimitScope) -> Result<bool> {
        let removed = self.maps.rate_limit.delete(&scope.key())?;
        if removed {
            info!(scope = scope.as_str(), "rate limit disabled");
        }
        Ok(removed)
    }

    pub fn clear_rate_limits(&self) -> Result<()> {
        self.disable_rate_limit(RateLimitScope::PerSource)?;
        self.disable_rate_limit(RateLimitScope::PerBackend)?;
        Ok(())
    }

    pub fn rate_limit(&self, scope: RateLimitScope) -> Option<(u32, u32)> {
        let value = self.maps.rate_limit.lookup(&scope.key())?;
        if value.len() != 8 {
            return None;
        }
        let rate = u32::from_le_bytes([value[0], value[1], value[2], value[3]]);
        let burst = u32::from_le_bytes([value[4], value[5], value[6], value[7]]);
        Some((rate, burst))
    }
}
