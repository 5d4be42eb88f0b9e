//! Read-side view of the kernel conntrack map.
//!
//! The kernel path owns every entry; user space only iterates snapshots.
//! A snapshot is internally consistent but two concurrent snapshots may
//! disagree, so callers tolerate drift between reads.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::codec::{ip_from_bytes, ConnState, ConntrackKey, ConntrackValue};
use crate::error::Result;
use crate::maps::MapHandle;

/// One observed connection, decoded from the map.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub orig_dst: (IpAddr, u16),
    pub nat_dst: (IpAddr, u16),
    pub created_ns: u64,
    pub last_seen_ns: u64,
    pub packets_fwd: u32,
    pub packets_rev: u32,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
    pub state: ConnState,
    pub proxy_flags: u8,
    pub seq_offset: u16,
    pub orig_client: (IpAddr, u16),
}

impl Connection {
    fn from_entry(key: &ConntrackKey, value: &ConntrackValue) -> Self {
        Self {
            src_ip: ip_from_bytes(&key.src_ip),
            dst_ip: ip_from_bytes(&key.dst_ip),
            src_port: key.src_port,
            dst_port: key.dst_port,
            protocol: key.protocol,
            orig_dst: (ip_from_bytes(&value.orig_dst_ip), value.orig_dst_port),
            nat_dst: (ip_from_bytes(&value.nat_dst_ip), value.nat_dst_port),
            created_ns: value.created_ns,
            last_seen_ns: value.last_seen_ns,
            packets_fwd: value.packets_fwd,
            packets_rev: value.packets_rev,
            bytes_fwd: value.bytes_fwd,
            bytes_rev: value.bytes_rev,
            state: value.conn_state,
            proxy_flags: value.proxy_flags,
            seq_offset: value.seq_offset,
            orig_client: (ip_from_bytes(&value.orig_client_ip), value.orig_client_port),
        }
    }
}

/// Aggregated per-backend traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetStats {
    pub connections: u64,
    pub packets_fwd: u64,
    pub packets_rev: u64,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
}

pub struct ConntrackReader {
    map: Arc<dyn MapHandle>,
    max_connections: usize,
}

impl ConntrackReader {
    pub fn new(map: Arc<dyn MapHandle>, max_connections: usize) -> Self {
        Self { map, max_connections }
    }

    /// Lazily decoded snapshot, bounded by `max_connections`. Entries
    /// that fail to decode are skipped with a warning; the kernel may be
    /// mid-update on them.
    pub fn get_all(&self) -> impl Iterator<Item = Connection> {
        self.map
            .iterate()
            .into_iter()
            .take(self.max_connections)
            .filter_map(|(k, v)| {
                let key = match ConntrackKey::decode(&k) {
                    Ok(key) => key,
                    Err(err) => {
                        warn!(%err, "skipping undecodable conntrack key");
                        return None;
                    }
                };
                let value = match ConntrackValue::decode(&v) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(%err, "skipping undecodable conntrack value");
                        return None;
                    }
                };
                Some(Connection::from_entry(&key, &value))
            })
    }

    pub fn count(&self) -> usize {
        self.get_all().count()
    }

    /// Connections currently NAT'd to `ip:port`.
    pub fn count_for_target(&self, ip: IpAddr, port: u16) -> usize {
        self.get_all().filter(|c| c.nat_dst == (ip, port)).count()
    }

    /// Connection counts grouped by NAT destination, for the weight
    /// pipeline's least-connections stage.
    pub fn counts_by_target(&self) -> HashMap<(IpAddr, u16), u64> {
        let mut counts = HashMap::new();
        for conn in self.get_all() {
            *counts.entry(conn.nat_dst).or_insert(0) += 1;
        }
        counts
    }

    /// Packet/byte totals grouped by NAT destination.
    pub fn stats(&self) -> HashMap<(IpAddr, u16), TargetStats> {
        let mut stats: HashMap<(IpAddr, u16), TargetStats> = HashMap::new();
        for conn in self.get_all() {
            let entry = stats.entry(conn.nat_dst).or_default();
            entry.connections += 1;
            entry.packets_fwd += u64::from(conn.packets_fwd);
            entry.packets_rev += u64::from(conn.packets_rev);
            entry.bytes_fwd += conn.bytes_fwd;
            entry.bytes_rev += conn.bytes_rev;
        }
        stats
    }

    /// Admin support: drop every tracked connection. The kernel will
    /// re-create entries as traffic flows.
    pub fn clear(&self) -> Result<usize> {
        let keys: Vec<Vec<u8>> = self.map.iterate().into_iter().map(|(k, _)| k).collect();
        let mut removed = 0;
        for key in keys {
            if self.map.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ip_to_bytes, PROXY_ENABLED};
    use crate::maps::MemoryMap;

    fn put_conn(map: &Arc<dyn MapHandle>, src_port: u16, nat: (&str, u16), bytes_fwd: u64) {
        let key = ConntrackKey {
            src_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
            dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
            src_port,
            dst_port: 443,
            protocol: 6,
        };
        let value = ConntrackValue {
            orig_dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
            nat_dst_ip: ip_to_bytes(nat.0.parse().unwrap()),
            orig_dst_port: 443,
            nat_dst_port: nat.1,
            last_seen_ns: 2,
            packets_fwd: 1,
            packets_rev: 1,
            bytes_fwd,
            bytes_rev: 0,
            conn_state: ConnState::Established,
            proxy_flags: PROXY_ENABLED,
            seq_offset: 0,
            orig_client_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
            orig_client_port: src_port,
            created_ns: 1,
        };
        map.insert(key.encode(), value.encode()).unwrap();
    }

    #[test]
    fn counts_and_stats_group_by_nat_destination() {
        let map: Arc<dyn MapHandle> = MemoryMap::shared();
        put_conn(&map, 1000, ("10.0.0.1", 8080), 100);
        put_conn(&map, 1001, ("10.0.0.1", 8080), 50);
        put_conn(&map, 1002, ("10.0.0.2", 8080), 10);

        let reader = ConntrackReader::new(map, 100_000);
        assert_eq!(reader.count(), 3);
        assert_eq!(reader.count_for_target("10.0.0.1".parse().unwrap(), 8080), 2);

        let stats = reader.stats();
        let s1 = &stats[&("10.0.0.1".parse().unwrap(), 8080)];
        assert_eq!(s1.connections, 2);
        assert_eq!(s1.bytes_fwd, 150);
    }

    #[test]
    fn snapshot_is_bounded() {
        let map: Arc<dyn MapHandle> = MemoryMap::shared();
        for p in 0..10 {
            put_conn(&map, 2000 + p, ("10.0.0.1", 8080), 1);
        }
        let reader = ConntrackReader::new(map, 4);
        assert_eq!(reader.count(), 4);
    }

    #[test]
    fn clear_empties_the_map() {
        let map: Arc<dyn MapHandle> = MemoryMap::shared();
        put_conn(&map, 1000, ("10.0.0.1", 8080), 1);
        let reader = ConntrackReader::new(map, 100);
        assert_eq!(reader.clear().unwrap(), 1);
        assert_eq!(reader.count(), 0);
    }
}
