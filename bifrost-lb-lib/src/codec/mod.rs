//! Bit-exact encode/decode of the structures shared with the kernel data
//! plane, plus the PROXY protocol v2 header.
//!
//! Every structure has a fixed length. Integers are little-endian except
//! in the PROXY v2 header, which is big-endian per its specification. IP
//! addresses use a unified 16-byte form: IPv4 is stored as 12 zero bytes
//! followed by the 4 address octets.
//!
//! The layouts here are the contract with the XDP/TC programs; changing a
//! single offset breaks NAT for live connections.

mod conntrack;
mod keys;
mod proxy_v2;
mod route;

pub use conntrack::{ConnState, ConntrackKey, ConntrackValue, PROXY_ENABLED, PROXY_HEADER_INJECTED};
pub use keys::{fnv1a_hash, ListenKey, LpmKey, SniKey, AF_TAG_V4, AF_TAG_V6};
pub use proxy_v2::{ProxyV2Header, PROXY_V2_LEN_V4, PROXY_V2_LEN_V6};
pub use route::{
    WeightedRouteValue, WeightedTarget, FLAG_PROXY_PROTOCOL_V2, FLAG_SESSION_PERSISTENCE,
    WEIGHTED_ROUTE_LEN,
};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{LbError, Result};

/// Convert an IP address to the unified 16-byte form.
pub fn ip_to_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => {
            let mut out = [0u8; 16];
            out[12..].copy_from_slice(&v4.octets());
            out
        }
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decode the unified 16-byte form back to an IP address.
///
/// A 96-bit zero prefix is taken to mean IPv4; IPv6 addresses inside
/// `::/96` are therefore not representable distinctly, which matches the
/// unified-form convention used by the kernel programs.
pub fn ip_from_bytes(bytes: &[u8; 16]) -> IpAddr {
    if bytes[..12].iter().all(|b| *b == 0) {
        IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    } else {
        IpAddr::V6(Ipv6Addr::from(*bytes))
    }
}

pub(crate) fn check_len(buf: &[u8], expected: usize, what: &str) -> Result<()> {
    if buf.len() != expected {
        return Err(LbError::invalid_param(
            what,
            format!("expected {expected} bytes, got {}", buf.len()),
        ));
    }
    Ok(())
}

pub(crate) fn read_u16_le(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

pub(crate) fn read_u32_le(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

pub(crate) fn read_u64_le(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

pub(crate) fn read_ip16(buf: &[u8], at: usize) -> [u8; 16] {
    let mut b = [0u8; 16];
    b.copy_from_slice(&buf[at..at + 16]);
    b
}
