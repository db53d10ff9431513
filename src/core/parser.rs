//! Packet header parser for Sift
//!
//! Decodes Ethernet, IPv4/IPv6, and TCP/UDP headers out of a raw frame with
//! explicit bounds checks. Every multi-byte field is big-endian on the wire.
//! The parser never reads past the frame; a failed check marks the frame
//! malformed and it is dropped before reaching the pipeline.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::core::packet::protocol;

/// Ethernet type codes Sift understands.
pub mod ether_type {
    pub const IPV4: u16 = 0x0800;
    pub const ARP: u16 = 0x0806;
    pub const IPV6: u16 = 0x86DD;
}

const ETHERNET_LEN: usize = 14;
const IPV4_MIN_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_MIN_LEN: usize = 20;
const UDP_LEN: usize = 8;

/// IPv6 next-header value for a fragment extension header.
const IPV6_NEXT_HEADER_FRAGMENT: u8 = 44;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame truncated in {layer} header: need {needed} bytes, have {available}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unsupported IP version {0}")]
    BadIpVersion(u8),

    #[error("invalid IPv4 header length {0}")]
    BadHeaderLength(usize),

    #[error("invalid TCP data offset {0}")]
    BadDataOffset(usize),

    #[error("empty frame")]
    EmptyFrame,
}

/// Decoded view of one frame. Offsets index into the original frame bytes.
#[derive(Debug, Clone, Default)]
pub struct ParsedPacket {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ether_type: u16,

    /// 0 when the frame carried no IP header.
    pub ip_version: u8,
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    /// u32 flow-key forms of the addresses (IPv6 folded).
    pub src_key: u32,
    pub dst_key: u32,
    pub protocol: u8,
    pub ttl: u8,

    pub has_tcp: bool,
    pub has_udp: bool,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub seq_number: u32,
    pub ack_number: u32,

    pub ip_offset: usize,
    pub transport_offset: usize,
    pub payload_offset: usize,
    pub payload_len: usize,

    pub is_fragmented: bool,
}

impl ParsedPacket {
    /// True when the frame carried an IP header of either version.
    pub fn has_ip(&self) -> bool {
        self.ip_version != 0
    }

    /// True when the frame parsed down to a TCP or UDP header.
    pub fn has_transport(&self) -> bool {
        self.has_tcp || self.has_udp
    }
}

/// Every field access is gated on this: the required bytes must fit between
/// `offset` and the end of the frame, without overflow.
fn bounds_check(offset: usize, required: usize, total: usize) -> bool {
    offset <= total && required <= total - offset
}

fn read_u16_be(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32_be(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Fold an IPv6 address into the u32 flow-key space by xoring its 4-byte
/// big-endian chunks.
fn fold_ipv6(addr: &[u8; 16]) -> u32 {
    let mut key: u32 = 0;
    for chunk in addr.chunks_exact(4) {
        key ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    key
}

/// Parser for link/network/transport headers.
pub struct PacketParser;

impl PacketParser {
    /// Decode a raw frame. Returns the parsed view, or the reason the frame
    /// is malformed. Non-IP frames parse successfully with `ip_version` 0;
    /// the engine discards them at its boundary.
    pub fn parse(frame: &[u8]) -> Result<ParsedPacket, ParseError> {
        if frame.is_empty() {
            return Err(ParseError::EmptyFrame);
        }

        let mut parsed = ParsedPacket::default();
        let mut offset: usize = 0;

        Self::parse_ethernet(frame, &mut parsed, &mut offset)?;

        match parsed.ether_type {
            ether_type::IPV4 => Self::parse_ipv4(frame, &mut parsed, &mut offset)?,
            ether_type::IPV6 => Self::parse_ipv6(frame, &mut parsed, &mut offset)?,
            _ => return Ok(parsed),
        }

        // Fragments keep their L3 payload opaque; no transport parse.
        if parsed.is_fragmented {
            parsed.payload_offset = offset;
            parsed.payload_len = frame.len() - offset;
            return Ok(parsed);
        }

        match parsed.protocol {
            protocol::TCP => Self::parse_tcp(frame, &mut parsed, &mut offset)?,
            protocol::UDP => Self::parse_udp(frame, &mut parsed, &mut offset)?,
            _ => return Ok(parsed),
        }

        parsed.payload_offset = offset;
        parsed.payload_len = frame.len() - offset;

        Ok(parsed)
    }

    fn parse_ethernet(
        frame: &[u8],
        parsed: &mut ParsedPacket,
        offset: &mut usize,
    ) -> Result<(), ParseError> {
        if !bounds_check(*offset, ETHERNET_LEN, frame.len()) {
            return Err(ParseError::Truncated {
                layer: "ethernet",
                needed: ETHERNET_LEN,
                available: frame.len() - *offset,
            });
        }

        parsed.dst_mac.copy_from_slice(&frame[*offset..*offset + 6]);
        parsed
            .src_mac
            .copy_from_slice(&frame[*offset + 6..*offset + 12]);
        parsed.ether_type = read_u16_be(frame, *offset + 12);

        *offset += ETHERNET_LEN;
        Ok(())
    }

    fn parse_ipv4(
        frame: &[u8],
        parsed: &mut ParsedPacket,
        offset: &mut usize,
    ) -> Result<(), ParseError> {
        if !bounds_check(*offset, IPV4_MIN_LEN, frame.len()) {
            return Err(ParseError::Truncated {
                layer: "ipv4",
                needed: IPV4_MIN_LEN,
                available: frame.len() - *offset,
            });
        }

        let ip: &[u8] = &frame[*offset..];
        let version: u8 = (ip[0] >> 4) & 0x0F;
        if version != 4 {
            return Err(ParseError::BadIpVersion(version));
        }

        let header_len = ((ip[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_LEN || !bounds_check(*offset, header_len, frame.len()) {
            return Err(ParseError::BadHeaderLength(header_len));
        }

        let flags_frag: u16 = read_u16_be(ip, 6);
        let more_fragments: bool = flags_frag & 0x2000 != 0;
        let fragment_offset: u16 = flags_frag & 0x1FFF;
        if more_fragments || fragment_offset != 0 {
            parsed.is_fragmented = true;
        }

        parsed.ip_version = 4;
        parsed.ip_offset = *offset;
        parsed.ttl = ip[8];
        parsed.protocol = ip[9];

        let src: u32 = read_u32_be(ip, 12);
        let dst: u32 = read_u32_be(ip, 16);
        parsed.src_addr = Some(IpAddr::V4(Ipv4Addr::from(src)));
        parsed.dst_addr = Some(IpAddr::V4(Ipv4Addr::from(dst)));
        parsed.src_key = src;
        parsed.dst_key = dst;

        *offset += header_len;
        Ok(())
    }

    fn parse_ipv6(
        frame: &[u8],
        parsed: &mut ParsedPacket,
        offset: &mut usize,
    ) -> Result<(), ParseError> {
        if !bounds_check(*offset, IPV6_LEN, frame.len()) {
            return Err(ParseError::Truncated {
                layer: "ipv6",
                needed: IPV6_LEN,
                available: frame.len() - *offset,
            });
        }

        let ip: &[u8] = &frame[*offset..];

        parsed.ip_version = 6;
        parsed.ip_offset = *offset;
        parsed.protocol = ip[6];
        parsed.ttl = ip[7];

        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&ip[8..24]);
        dst.copy_from_slice(&ip[24..40]);
        parsed.src_addr = Some(IpAddr::V6(Ipv6Addr::from(src)));
        parsed.dst_addr = Some(IpAddr::V6(Ipv6Addr::from(dst)));
        parsed.src_key = fold_ipv6(&src);
        parsed.dst_key = fold_ipv6(&dst);

        // Extension headers are not traversed; a fragment header right
        // after the fixed header marks the packet fragmented.
        if parsed.protocol == IPV6_NEXT_HEADER_FRAGMENT {
            parsed.is_fragmented = true;
        }

        *offset += IPV6_LEN;
        Ok(())
    }

    fn parse_tcp(
        frame: &[u8],
        parsed: &mut ParsedPacket,
        offset: &mut usize,
    ) -> Result<(), ParseError> {
        if !bounds_check(*offset, TCP_MIN_LEN, frame.len()) {
            return Err(ParseError::Truncated {
                layer: "tcp",
                needed: TCP_MIN_LEN,
                available: frame.len() - *offset,
            });
        }

        let tcp: &[u8] = &frame[*offset..];

        parsed.src_port = read_u16_be(tcp, 0);
        parsed.dst_port = read_u16_be(tcp, 2);
        parsed.seq_number = read_u32_be(tcp, 4);
        parsed.ack_number = read_u32_be(tcp, 8);

        let header_len = (((tcp[12] >> 4) & 0x0F) as usize) * 4;
        if header_len < TCP_MIN_LEN || !bounds_check(*offset, header_len, frame.len()) {
            return Err(ParseError::BadDataOffset(header_len));
        }

        parsed.tcp_flags = tcp[13];
        parsed.has_tcp = true;
        parsed.transport_offset = *offset;

        *offset += header_len;
        Ok(())
    }

    fn parse_udp(
        frame: &[u8],
        parsed: &mut ParsedPacket,
        offset: &mut usize,
    ) -> Result<(), ParseError> {
        if !bounds_check(*offset, UDP_LEN, frame.len()) {
            return Err(ParseError::Truncated {
                layer: "udp",
                needed: UDP_LEN,
                available: frame.len() - *offset,
            });
        }

        let udp: &[u8] = &frame[*offset..];

        parsed.src_port = read_u16_be(udp, 0);
        parsed.dst_port = read_u16_be(udp, 2);
        parsed.has_udp = true;
        parsed.transport_offset = *offset;

        *offset += UDP_LEN;
        Ok(())
    }
}
