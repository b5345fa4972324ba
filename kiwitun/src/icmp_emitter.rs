//! Constructs and transmits ICMPv4/ICMPv6 error messages quoting the
//! offending packet.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;

use ip_packet::{Icmpv4ViewMut, Icmpv6ViewMut, Ipv4HeaderViewMut, Ipv6HeaderViewMut};

use crate::error::EngineError;

pub const ICMP_PROTOCOL: u8 = 1;
pub const ICMPV6_NEXT_HEADER: u8 = 58;

pub const ICMP_TIME_EXCEEDED: (u8, u8) = (11, 0);
pub const ICMP_DEST_UNREACH_HOST_UNKNOWN: (u8, u8) = (3, 7);
pub const ICMPV6_TIME_EXCEEDED: (u8, u8) = (3, 0);
pub const ICMPV6_DEST_UNREACHABLE: (u8, u8) = (1, 0);

const OFFENDING_QUOTE_LEN: usize = 8;

/// Builds and transmits an ICMPv4 error quoting `offending`'s IPv4
/// header plus its first 8 payload bytes.
///
/// `offending` must be at least 28 bytes (20-byte header + 8 bytes of
/// payload); shorter input is rejected as [`EngineError::InvalidPacket`]
/// rather than emitting a malformed message.
pub fn send_icmpv4_error(
    fd: RawFd,
    local: Ipv4Addr,
    offending: &[u8],
    type_code: (u8, u8),
    rest: u32,
) -> Result<(), EngineError> {
    if offending.len() < ip_packet::IPV4_HEADER_LEN + OFFENDING_QUOTE_LEN {
        return Err(EngineError::InvalidPacket(
            "offending packet too short for ICMP construction",
        ));
    }

    let offending_header = ip_packet::Ipv4HeaderView::from_slice(offending)
        .map_err(|_| EngineError::InvalidPacket("offending packet is not a valid IPv4 header"))?;
    let destination = offending_header.source();

    let quoted_len = ip_packet::IPV4_HEADER_LEN + OFFENDING_QUOTE_LEN;
    let mut buf = vec![0u8; ip_packet::IPV4_HEADER_LEN + ip_packet::icmp::ICMP_HEADER_LEN + quoted_len];

    {
        let mut outer = Ipv4HeaderViewMut::from_slice(&mut buf[..ip_packet::IPV4_HEADER_LEN]).expect("buffer sized for header");
        outer.set_version_ihl(5);
        outer.set_tos(0);
        outer.set_total_len(0); // kernel fills total_len under IP_HDRINCL when zero
        outer.set_identification(0);
        outer.set_flags_fragment_offset(0);
        outer.set_ttl(64);
        outer.set_protocol(ICMP_PROTOCOL);
        outer.set_source(local);
        outer.set_destination(destination);
        outer.set_checksum(0);
        outer.stamp_checksum();
    }

    let icmp_segment = &mut buf[ip_packet::IPV4_HEADER_LEN..];
    icmp_segment[ip_packet::icmp::ICMP_HEADER_LEN..].copy_from_slice(&offending[..quoted_len]);
    {
        let mut icmp = Icmpv4ViewMut::from_slice(icmp_segment).expect("buffer sized for header");
        icmp.set_type_code(type_code.0, type_code.1);
        icmp.set_rest(rest);
        icmp.set_checksum(0);
        icmp.stamp_checksum();
    }

    transmit_v4(fd, &buf, destination)
}

/// Builds and transmits an ICMPv6 error quoting `offending`'s IPv6
/// header plus its first 8 payload bytes.
pub fn send_icmpv6_error(
    fd: RawFd,
    local6: Ipv6Addr,
    offending: &[u8],
    type_code: (u8, u8),
    rest: u32,
) -> Result<(), EngineError> {
    if offending.len() < ip_packet::IPV6_HEADER_LEN + OFFENDING_QUOTE_LEN {
        return Err(EngineError::InvalidPacket(
            "offending packet too short for ICMPv6 construction",
        ));
    }

    let offending_header = ip_packet::Ipv6HeaderView::from_slice(offending)
        .map_err(|_| EngineError::InvalidPacket("offending packet is not a valid IPv6 header"))?;
    let destination = offending_header.source();

    let quoted_len = ip_packet::IPV6_HEADER_LEN + OFFENDING_QUOTE_LEN;
    let icmp_len = ip_packet::icmp::ICMP_HEADER_LEN + quoted_len;
    let mut buf = vec![0u8; ip_packet::IPV6_HEADER_LEN + icmp_len];

    {
        let mut outer = Ipv6HeaderViewMut::from_slice(&mut buf[..ip_packet::IPV6_HEADER_LEN]).expect("buffer sized for header");
        outer.set_version_traffic_class_flow_label(6);
        outer.set_payload_len(icmp_len as u16);
        outer.set_next_header(ICMPV6_NEXT_HEADER);
        outer.set_hop_limit(64);
        outer.set_source(local6);
        outer.set_destination(destination);
    }

    let icmp_segment = &mut buf[ip_packet::IPV6_HEADER_LEN..];
    icmp_segment[ip_packet::icmp::ICMP_HEADER_LEN..].copy_from_slice(&offending[..quoted_len]);
    {
        let mut icmp = Icmpv6ViewMut::from_slice(icmp_segment).expect("buffer sized for header");
        icmp.set_type_code(type_code.0, type_code.1);
        icmp.set_rest(rest);
        icmp.set_checksum(0);
        icmp.stamp_checksum(&local6, &destination);
    }

    transmit_v6(fd, &buf, destination)
}

/// Sends a complete, header-included IPv4 datagram. Shared with the
/// tunnel encap paths, which transmit over the same raw socket.
pub(crate) fn transmit_v4(fd: RawFd, buf: &[u8], destination: Ipv4Addr) -> Result<(), EngineError> {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as u16;
    addr.sin_addr.s_addr = u32::from(destination).to_be();

    // Safety: `buf` is valid for `buf.len()` bytes and `addr` is a
    // correctly sized, initialized `sockaddr_in`.
    let sent = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as u32,
        )
    };
    check_sendto(sent, buf.len())
}

fn transmit_v6(fd: RawFd, buf: &[u8], destination: Ipv6Addr) -> Result<(), EngineError> {
    let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    addr.sin6_family = libc::AF_INET6 as u16;
    addr.sin6_addr.s6_addr = destination.octets();

    // Safety: `buf` is valid for `buf.len()` bytes and `addr` is a
    // correctly sized, initialized `sockaddr_in6`.
    let sent = unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as u32,
        )
    };
    check_sendto(sent, buf.len())
}

fn check_sendto(sent: isize, expected: usize) -> Result<(), EngineError> {
    if sent < 0 {
        return Err(EngineError::TransientIo(std::io::Error::last_os_error()));
    }
    if sent as usize != expected {
        return Err(EngineError::TransientIo(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "partial ICMP transmit",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ipv4_packet() -> Vec<u8> {
        let mut buf = vec![0u8; ip_packet::IPV4_HEADER_LEN + OFFENDING_QUOTE_LEN];
        {
            let mut view = Ipv4HeaderViewMut::from_slice(&mut buf[..ip_packet::IPV4_HEADER_LEN]).unwrap();
            view.set_version_ihl(5);
            view.set_ttl(1);
            view.set_source(Ipv4Addr::new(192, 168, 1, 5));
            view.set_destination(Ipv4Addr::new(192, 168, 2, 9));
            view.stamp_checksum();
        }
        buf
    }

    #[test]
    fn rejects_short_offending_packet() {
        let short = [0u8; 10];
        let err = send_icmpv4_error(-1, Ipv4Addr::UNSPECIFIED, &short, ICMP_TIME_EXCEEDED, 0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPacket(_)));
    }

    #[test]
    fn builds_without_transmitting_when_fd_invalid() {
        let packet = sample_ipv4_packet();
        // fd -1 makes sendto fail, but we only care that construction up
        // to the syscall didn't panic on malformed buffer math.
        let result = send_icmpv4_error(-1, Ipv4Addr::UNSPECIFIED, &packet, ICMP_TIME_EXCEEDED, 0);
        assert!(result.is_err());
    }
}
