use std::net::IpAddr;

use bytes::BufMut;
use ipnet::IpNet;

use super::{check_len, ip_from_bytes, ip_to_bytes, read_u16_le, read_u32_le, read_u64_le};
use crate::error::Result;

pub const AF_TAG_V4: u16 = 0;
pub const AF_TAG_V6: u16 = 1;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over the lower-cased bytes of `hostname`.
///
/// The XDP program hashes the SNI extension bytes the same way, so
/// `hash(upper(h)) == hash(lower(h))` must hold on both sides.
pub fn fnv1a_hash(hostname: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for b in hostname.bytes() {
        hash ^= u64::from(b.to_ascii_lowercase());
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Key of the source-route LPM map (20 bytes).
///
/// ```text
/// offset 0: prefix_len  u32 LE   (bits, over the unified 16-byte ip)
/// offset 4: ip          [u8;16]
/// ```
///
/// IPv4 prefixes are offset by 96 so longest-prefix match works over the
/// unified form: `10.0.0.0/24` is stored as `/120`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LpmKey {
    pub prefix_len: u32,
    pub ip: [u8; 16],
}

impl LpmKey {
    pub const LEN: usize = 20;

    pub fn from_net(net: &IpNet) -> Self {
        let prefix_len = match net {
            IpNet::V4(_) => u32::from(net.prefix_len()) + 96,
            IpNet::V6(_) => u32::from(net.prefix_len()),
        };
        Self { prefix_len, ip: ip_to_bytes(net.network()) }
    }

    /// Reverse of [`LpmKey::from_net`]; `None` for prefix lengths no CIDR
    /// can produce.
    pub fn to_net(&self) -> Option<IpNet> {
        let ip = ip_from_bytes(&self.ip);
        match ip {
            IpAddr::V4(v4) => {
                let len = u8::try_from(self.prefix_len.checked_sub(96)?).ok()?;
                IpNet::new(IpAddr::V4(v4), len).ok()
            }
            IpAddr::V6(v6) => {
                let len = u8::try_from(self.prefix_len).ok()?;
                IpNet::new(IpAddr::V6(v6), len).ok()
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_u32_le(self.prefix_len);
        buf.put_slice(&self.ip);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "lpm key")?;
        Ok(Self { prefix_len: read_u32_le(buf, 0), ip: super::read_ip16(buf, 4) })
    }
}

/// Key of the listen map (8 bytes).
///
/// ```text
/// offset 0: ifindex  u32 LE
/// offset 4: port     u16 LE
/// offset 6: af_tag   u16 LE   (0 = IPv4, 1 = IPv6)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenKey {
    pub ifindex: u32,
    pub port: u16,
    pub af_tag: u16,
}

impl ListenKey {
    pub const LEN: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_u32_le(self.ifindex);
        buf.put_u16_le(self.port);
        buf.put_u16_le(self.af_tag);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "listen key")?;
        Ok(Self { ifindex: read_u32_le(buf, 0), port: read_u16_le(buf, 4), af_tag: read_u16_le(buf, 6) })
    }
}

/// Key of the SNI route map (8 bytes): the FNV-1a hash of the lower-cased
/// hostname, little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SniKey {
    pub hostname_hash: u64,
}

impl SniKey {
    pub const LEN: usize = 8;

    pub fn from_hostname(hostname: &str) -> Self {
        Self { hostname_hash: fnv1a_hash(hostname) }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.hostname_hash.to_le_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        check_len(buf, Self::LEN, "sni key")?;
        Ok(Self { hostname_hash: read_u64_le(buf, 0) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(fnv1a_hash(""), FNV_OFFSET_BASIS);
        // Published FNV-1a 64 test vector.
        assert_eq!(fnv1a_hash("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn fnv1a_case_insensitive() {
        assert_eq!(fnv1a_hash("API.Example.COM"), fnv1a_hash("api.example.com"));
    }

    #[test]
    fn lpm_key_v4_offset() {
        let net: IpNet = "10.1.0.0/16".parse().unwrap();
        let key = LpmKey::from_net(&net);
        assert_eq!(key.prefix_len, 112);
        assert_eq!(key.to_net(), Some(net));
        assert_eq!(key.encode().len(), LpmKey::LEN);
        assert_eq!(LpmKey::decode(&key.encode()).unwrap(), key);
    }

    #[test]
    fn lpm_key_v6_roundtrip() {
        let net: IpNet = "2001:db8::/48".parse().unwrap();
        let key = LpmKey::from_net(&net);
        assert_eq!(key.prefix_len, 48);
        assert_eq!(LpmKey::decode(&key.encode()).unwrap(), key);
        assert_eq!(key.to_net(), Some(net));
    }

    #[test]
    fn listen_key_layout() {
        let key = ListenKey { ifindex: 3, port: 8443, af_tag: AF_TAG_V6 };
        let buf = key.encode();
        assert_eq!(buf.len(), ListenKey::LEN);
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        assert_eq!(&buf[4..6], &8443u16.to_le_bytes());
        assert_eq!(ListenKey::decode(&buf).unwrap(), key);
    }

    #[test]
    fn sni_key_roundtrip() {
        let key = SniKey::from_hostname("API.example.com");
        assert_eq!(key, SniKey::from_hostname("api.example.com"));
        assert_eq!(SniKey::decode(&key.encode()).unwrap(), key);
    }
}
