use std::net::IpAddr;

use bytes::BufMut;

use crate::error::{LbError, Result};

/// PROXY protocol v2 signature, first 12 bytes of every header.
const SIGNATURE: [u8; 12] = [0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A];

/// Version 2, command PROXY.
const VER_CMD: u8 = 0x21;
/// AF_INET, STREAM.
const FAM_INET_STREAM: u8 = 0x11;
/// AF_INET6, STREAM.
const FAM_INET6_STREAM: u8 = 0x21;

const ADDR_LEN_V4: u16 = 12;
const ADDR_LEN_V6: u16 = 36;

/// Encoded size for an IPv4 header.
pub const PROXY_V2_LEN_V4: usize = 16 + ADDR_LEN_V4 as usize;
/// Encoded size for an IPv6 header.
pub const PROXY_V2_LEN_V6: usize = 16 + ADDR_LEN_V6 as usize;

/// PROXY protocol v2 header carrying the original client endpoint.
///
/// The kernel egress program synthesizes this from the conntrack entry's
/// `orig_client_*` fields on the first data segment toward the backend;
/// this encoder exists so the layout can be validated against it. All
/// multi-byte fields are big-endian per the PROXY v2 specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyV2Header {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ProxyV2Header {
    /// Encoded byte length for this header's address family.
    pub fn encoded_len(&self) -> usize {
        match self.src_ip {
            IpAddr::V4(_) => PROXY_V2_LEN_V4,
            IpAddr::V6(_) => PROXY_V2_LEN_V6,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_slice(&SIGNATURE);
        buf.put_u8(VER_CMD);
        match (self.src_ip, self.dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.put_u8(FAM_INET_STREAM);
                buf.put_u16(ADDR_LEN_V4);
                buf.put_slice(&src.octets());
                buf.put_slice(&dst.octets());
            }
            (IpAddr::V6(src), IpAddr::V6(dst)) => {
                buf.put_u8(FAM_INET6_STREAM);
                buf.put_u16(ADDR_LEN_V6);
                buf.put_slice(&src.octets());
                buf.put_slice(&dst.octets());
            }
            _ => {
                return Err(LbError::invalid_param(
                    "proxy_v2",
                    "source and destination address families differ",
                ))
            }
        }
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(LbError::invalid_param("proxy_v2", "header truncated"));
        }
        if buf[..12] != SIGNATURE {
            return Err(LbError::invalid_param("proxy_v2", "bad signature"));
        }
        if buf[12] != VER_CMD {
            return Err(LbError::invalid_param(
                "proxy_v2",
                format!("unsupported version/command byte 0x{:02x}", buf[12]),
            ));
        }
        let addr_len = u16::from_be_bytes([buf[14], buf[15]]);
        let body = &buf[16..];
        match buf[13] {
            FAM_INET_STREAM => {
                if addr_len != ADDR_LEN_V4 || body.len() < ADDR_LEN_V4 as usize {
                    return Err(LbError::invalid_param("proxy_v2", "bad IPv4 address block"));
                }
                let mut src = [0u8; 4];
                let mut dst = [0u8; 4];
                src.copy_from_slice(&body[0..4]);
                dst.copy_from_slice(&body[4..8]);
                Ok(Self {
                    src_ip: IpAddr::from(src),
                    dst_ip: IpAddr::from(dst),
                    src_port: u16::from_be_bytes([body[8], body[9]]),
                    dst_port: u16::from_be_bytes([body[10], body[11]]),
                })
            }
            FAM_INET6_STREAM => {
                if addr_len != ADDR_LEN_V6 || body.len() < ADDR_LEN_V6 as usize {
                    return Err(LbError::invalid_param("proxy_v2", "bad IPv6 address block"));
                }
                let mut src = [0u8; 16];
                let mut dst = [0u8; 16];
                src.copy_from_slice(&body[0..16]);
                dst.copy_from_slice(&body[16..32]);
                Ok(Self {
                    src_ip: IpAddr::from(src),
                    dst_ip: IpAddr::from(dst),
                    src_port: u16::from_be_bytes([body[32], body[33]]),
                    dst_port: u16::from_be_bytes([body[34], body[35]]),
                })
            }
            other => Err(LbError::invalid_param(
                "proxy_v2",
                format!("unsupported family/protocol byte 0x{other:02x}"),
            )),
        }
    }
}
