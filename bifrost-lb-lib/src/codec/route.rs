use std::net::IpAddr;

use bytes::BufMut;

use super::{check_len, ip_from_bytes, ip_to_bytes, read_ip16, read_u16_le, read_u32_le};
use crate::error::{LbError, Result};

/// The kernel applies session persistence (client-ip stickiness) for this
/// route.
pub const FLAG_SESSION_PERSISTENCE: u16 = 1 << 0;
/// The kernel injects a PROXY v2 header toward the backend.
pub const FLAG_PROXY_PROTOCOL_V2: u16 = 1 << 2;

/// Fixed encoded size: 8-byte header plus 8 target records of 20 bytes.
pub const WEIGHTED_ROUTE_LEN: usize = 8 + MAX_TARGETS * TARGET_RECORD_LEN;

const MAX_TARGETS: usize = 8;
const TARGET_RECORD_LEN: usize = 20;

/// One backend record inside a weighted route value.
///
/// ```text
/// offset  0: ip                 [u8;16]
/// offset 16: port               u16 LE
/// offset 18: cumulative_weight  u8
/// offset 19: pad                u8
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedTarget {
    pub ip: IpAddr,
    pub port: u16,
    pub cumulative_weight: u8,
}

/// Value shared by the listen, LPM and SNI maps (168 bytes on the wire).
///
/// Header:
/// ```text
/// offset 0: target_count  u8
/// offset 1: pad           u8
/// offset 2: flags         u16 LE
/// offset 4: reserved      u32 LE
/// ```
/// followed by `target_count` records; the remaining records are zeroed.
/// Unknown `flags` bits are carried verbatim so newer kernel programs and
/// older control planes can coexist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedRouteValue {
    pub flags: u16,
    pub targets: Vec<WeightedTarget>,
}

impl WeightedRouteValue {
    pub fn new(flags: u16, targets: Vec<WeightedTarget>) -> Result<Self> {
        if targets.is_empty() || targets.len() > MAX_TARGETS {
            return Err(LbError::OperationFailed(format!(
                "weighted route needs 1..={MAX_TARGETS} targets, got {}",
                targets.len()
            )));
        }
        Ok(Self { flags, targets })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(WEIGHTED_ROUTE_LEN);
        buf.put_u8(self.targets.len() as u8);
        buf.put_u8(0);
        buf.put_u16_le(self.flags);
        buf.put_u32_le(0);
        for t in &self.targets {
            buf.put_slice(&ip_to_bytes(t.ip));
            buf.put_u16_le(t.port);
            buf.put_u8(t.cumulative_weight);
            buf.put_u8(0);
        }
        buf.put_bytes(0, WEIGHTED_ROUTE_LEN - buf.len());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, WEIGHTED_ROUTE_LEN, "weighted route value")?;
        let count = usize::from(buf[0]);
        if count == 0 || count > MAX_TARGETS {
            return Err(LbError::invalid_param("target_count", format!("{count} out of range")));
        }
        let flags = read_u16_le(buf, 2);
        let _reserved = read_u32_le(buf, 4);
        let mut targets = Vec::with_capacity(count);
        for i in 0..count {
            let at = 8 + i * TARGET_RECORD_LEN;
            targets.push(WeightedTarget {
                ip: ip_from_bytes(&read_ip16(buf, at)),
                port: read_u16_le(buf, at + 16),
                cumulative_weight: buf[at + 18],
            });
        }
        Ok(Self { flags, targets })
    }
}
