use bytes::BufMut;

use super::{check_len, read_ip16, read_u16_le, read_u32_le, read_u64_le};
use crate::error::{LbError, Result};

/// Connection entry is PROXY-protocol enabled for this route.
pub const PROXY_ENABLED: u8 = 1 << 0;
/// The v2 header has already been injected toward the backend.
pub const PROXY_HEADER_INJECTED: u8 = 1 << 1;

/// TCP-level state of a tracked connection, as recorded by the ingress
/// program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    New = 0,
    SynSent = 1,
    SynRecv = 2,
    Established = 3,
}

impl ConnState {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ConnState::New),
            1 => Ok(ConnState::SynSent),
            2 => Ok(ConnState::SynRecv),
            3 => Ok(ConnState::Established),
            other => Err(LbError::invalid_param("conn_state", format!("unknown value {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::New => "new",
            ConnState::SynSent => "syn_sent",
            ConnState::SynRecv => "syn_recv",
            ConnState::Established => "established",
        }
    }
}

/// Key of the conntrack map (40 bytes): the client 5-tuple.
///
/// ```text
/// offset  0: src_ip    [u8;16]
/// offset 16: dst_ip    [u8;16]
/// offset 32: src_port  u16 LE
/// offset 34: dst_port  u16 LE
/// offset 36: protocol  u8
/// offset 37: pad       u8
/// offset 38: reserved  u16 LE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConntrackKey {
    pub src_ip: [u8; 16],
    pub dst_ip: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl ConntrackKey {
    pub const LEN: usize = 40;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_slice(&self.src_ip);
        buf.put_slice(&self.dst_ip);
        buf.put_u16_le(self.src_port);
        buf.put_u16_le(self.dst_port);
        buf.put_u8(self.protocol);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "conntrack key")?;
        Ok(Self {
            src_ip: read_ip16(buf, 0),
            dst_ip: read_ip16(buf, 16),
            src_port: read_u16_le(buf, 32),
            dst_port: read_u16_le(buf, 34),
            protocol: buf[36],
        })
    }
}

/// Value of the conntrack map (128 bytes).
///
/// ```text
/// offset   0: orig_dst_ip       [u8;16]
/// offset  16: nat_dst_ip        [u8;16]
/// offset  32: orig_dst_port     u16 LE
/// offset  34: nat_dst_port      u16 LE
/// offset  36: last_seen_ns      u64 LE
/// offset  44: packets_fwd       u32 LE
/// offset  48: packets_rev       u32 LE
/// offset  52: bytes_fwd         u64 LE
/// offset  60: bytes_rev         u64 LE
/// offset  68: conn_state        u8
/// offset  69: proxy_flags       u8
/// offset  70: seq_offset        u16 LE
/// offset  72: orig_client_ip    [u8;16]
/// offset  88: orig_client_port  u16 LE
/// offset  90: created_ns        u64 LE
/// offset  98: pad (zero)        [u8;30]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConntrackValue {
    pub orig_dst_ip: [u8; 16],
    pub nat_dst_ip: [u8; 16],
    pub orig_dst_port: u16,
    pub nat_dst_port: u16,
    pub last_seen_ns: u64,
    pub packets_fwd: u32,
    pub packets_rev: u32,
    pub bytes_fwd: u64,
    pub bytes_rev: u64,
    pub conn_state: ConnState,
    pub proxy_flags: u8,
    pub seq_offset: u16,
    pub orig_client_ip: [u8; 16],
    pub orig_client_port: u16,
    pub created_ns: u64,
}

impl ConntrackValue {
    pub const LEN: usize = 128;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_slice(&self.orig_dst_ip);
        buf.put_slice(&self.nat_dst_ip);
        buf.put_u16_le(self.orig_dst_port);
        buf.put_u16_le(self.nat_dst_port);
        buf.put_u64_le(self.last_seen_ns);
        buf.put_u32_le(self.packets_fwd);
        buf.put_u32_le(self.packets_rev);
        buf.put_u64_le(self.bytes_fwd);
        buf.put_u64_le(self.bytes_rev);
        buf.put_u8(self.conn_state as u8);
        buf.put_u8(self.proxy_flags);
        buf.put_u16_le(self.seq_offset);
        buf.put_slice(&self.orig_client_ip);
        buf.put_u16_le(self.orig_client_port);
        buf.put_u64_le(self.created_ns);
        buf.put_bytes(0, Self::LEN - buf.len());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "conntrack value")?;
        Ok(Self {
            orig_dst_ip: read_ip16(buf, 0),
            nat_dst_ip: read_ip16(buf, 16),
            orig_dst_port: read_u16_le(buf, 32),
            nat_dst_port: read_u16_le(buf, 34),
            last_seen_ns: read_u64_le(buf, 36),
            packets_fwd: read_u32_le(buf, 44),
            packets_rev: read_u32_le(buf, 48),
            bytes_fwd: read_u64_le(buf, 52),
            bytes_rev: read_u64_le(buf, 60),
            conn_state: ConnState::from_u8(buf[68])?,
            proxy_flags: buf[69],
            seq_offset: read_u16_le(buf, 70),
            orig_client_ip: read_ip16(buf, 72),
            orig_client_port: read_u16_le(buf, 88),
            created_ns: read_u64_le(buf, 90),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ip_to_bytes;

    fn sample_value() -> ConntrackValue {
        ConntrackValue {
            orig_dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
            nat_dst_ip: ip_to_bytes("10.0.0.1".parse().unwrap()),
            orig_dst_port: 443,
            nat_dst_port: 8443,
            last_seen_ns: 1_700_000_000_000_000_000,
            packets_fwd: 12,
            packets_rev: 9,
            bytes_fwd: 4096,
            bytes_rev: 16384,
            conn_state: ConnState::Established,
            proxy_flags: PROXY_ENABLED | PROXY_HEADER_INJECTED,
            seq_offset: 28,
            orig_client_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
            orig_client_port: 54123,
            created_ns: 1_699_999_999_000_000_000,
        }
    }

    #[test]
    fn key_is_40_bytes_and_roundtrips() {
        let key = ConntrackKey {
            src_ip: ip_to_bytes("198.51.100.7".parse().unwrap()),
            dst_ip: ip_to_bytes("192.0.2.10".parse().unwrap()),
            src_port: 54123,
            dst_port: 443,
            protocol: 6,
        };
        let buf = key.encode();
        assert_eq!(buf.len(), ConntrackKey::LEN);
        assert_eq!(ConntrackKey::decode(&buf).unwrap(), key);
    }

    #[test]
    fn value_is_128_bytes_and_roundtrips() {
        let value = sample_value();
        let buf = value.encode();
        assert_eq!(buf.len(), ConntrackValue::LEN);
        assert_eq!(ConntrackValue::decode(&buf).unwrap(), value);
        // Pad region stays zero.
        assert!(buf[98..].iter().all(|b| *b == 0));
    }

    #[test]
    fn value_field_offsets() {
        let buf = sample_value().encode();
        assert_eq!(read_u16_le(&buf, 32), 443);
        assert_eq!(read_u16_le(&buf, 34), 8443);
        assert_eq!(buf[68], ConnState::Established as u8);
        assert_eq!(buf[69], PROXY_ENABLED | PROXY_HEADER_INJECTED);
        assert_eq!(read_u16_le(&buf, 70), 28);
        assert_eq!(read_u16_le(&buf, 88), 54123);
    }

    #[test]
    fn rejects_unknown_conn_state() {
        let mut buf = sample_value().encode();
        buf[68] = 9;
        assert!(ConntrackValue::decode(&buf).is_err());
    }
}
