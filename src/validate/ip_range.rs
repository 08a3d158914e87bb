//! Address range tables and containment tests.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A blocked address range.
///
/// IPv4 ranges carry inclusive bounds; IPv6 ranges are CIDR blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpRange {
    V4 { start: Ipv4Addr, end: Ipv4Addr },
    V6 { network: Ipv6Addr, prefix_len: u8 },
}

impl IpRange {
    const fn v4(start: [u8; 4], end: [u8; 4]) -> Self {
        Self::V4 {
            start: Ipv4Addr::new(start[0], start[1], start[2], start[3]),
            end: Ipv4Addr::new(end[0], end[1], end[2], end[3]),
        }
    }

    const fn v6(segments: [u16; 8], prefix_len: u8) -> Self {
        let [a, b, c, d, e, f, g, h] = segments;
        Self::V6 {
            network: Ipv6Addr::new(a, b, c, d, e, f, g, h),
            prefix_len,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { start, end }, IpAddr::V4(v4)) => ipv4_in_range(v4, *start, *end),
            (Self::V6 { network, prefix_len }, IpAddr::V6(v6)) => {
                ipv6_in_range(v6, *network, *prefix_len)
            }
            _ => false,
        }
    }
}

/// RFC 1918, loopback, and link-local (which covers the cloud metadata
/// endpoint at 169.254.169.254).
pub const BLOCKED_IPV4: &[IpRange] = &[
    IpRange::v4([10, 0, 0, 0], [10, 255, 255, 255]),
    IpRange::v4([172, 16, 0, 0], [172, 31, 255, 255]),
    IpRange::v4([192, 168, 0, 0], [192, 168, 255, 255]),
    IpRange::v4([127, 0, 0, 0], [127, 255, 255, 255]),
    IpRange::v4([169, 254, 0, 0], [169, 254, 255, 255]),
];

/// Loopback, link-local, unique-local, and IPv4-mapped. The mapped block is
/// rejected outright so a blocked IPv4 address cannot be smuggled through
/// `::ffff:a.b.c.d`.
pub const BLOCKED_IPV6: &[IpRange] = &[
    IpRange::v6([0, 0, 0, 0, 0, 0, 0, 1], 128),
    IpRange::v6([0xfe80, 0, 0, 0, 0, 0, 0, 0], 10),
    IpRange::v6([0xfc00, 0, 0, 0, 0, 0, 0, 0], 7),
    IpRange::v6([0, 0, 0, 0, 0, 0xffff, 0, 0], 96),
];

/// Inclusive bounds, compared as 32-bit unsigned integers.
pub fn ipv4_in_range(ip: Ipv4Addr, start: Ipv4Addr, end: Ipv4Addr) -> bool {
    let ip = u32::from(ip);
    u32::from(start) <= ip && ip <= u32::from(end)
}

/// CIDR containment: whole bytes are compared directly, then the remaining
/// bits of the next byte under a `0xFF << (8 - bits)` mask.
pub fn ipv6_in_range(ip: Ipv6Addr, network: Ipv6Addr, prefix_len: u8) -> bool {
    let prefix_len = prefix_len.min(128) as usize;
    let ip = ip.octets();
    let network = network.octets();

    let full_bytes = prefix_len / 8;
    if ip[..full_bytes] != network[..full_bytes] {
        return false;
    }

    let remaining_bits = prefix_len % 8;
    if remaining_bits == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - remaining_bits);
    (ip[full_bytes] & mask) == (network[full_bytes] & mask)
}

pub fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_unspecified() || BLOCKED_IPV4.iter().any(|r| r.contains(IpAddr::V4(ip)))
}

pub fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    ip.is_unspecified() || BLOCKED_IPV6.iter().any(|r| r.contains(IpAddr::V6(ip)))
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}
