//! tun-to-socket paths: read an inner packet from the tun descriptor,
//! wrap it in an outer IPv4 header, and transmit it to the tunnel peer.

use std::os::fd::RawFd;

use ip_packet::{Ipv4HeaderView, Ipv4HeaderViewMut, Ipv6HeaderView, Ipv6HeaderViewMut};

use crate::config::Config;
use crate::error::EngineError;
use crate::icmp_emitter;
use crate::route_mirror::RouteMirror;

const DF_FLAG: u16 = 0x4000;

/// Encapsulates an inner IPv4 packet at `buf[20..20 + size]` into the
/// reserved 20-byte prefix and transmits it on `v4_fd`.
///
/// Returns `Ok(())` on a successful transmit. Any other outcome — a
/// silent TTL-zero drop, a TTL-expiry ICMP, a no-route ICMP, the RFC
/// 2003 loopback guard, or a malformed inner packet — is reported as an
/// `Err`, which the caller logs without treating as a fault.
pub fn encap_v4(
    buf: &mut [u8],
    size: usize,
    config: &Config,
    routes: &RouteMirror,
    v4_fd: RawFd,
) -> Result<(), EngineError> {
    let inner_slice = buf
        .get(ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size)
        .ok_or(EngineError::InvalidPacket("buffer shorter than declared size"))?;

    let inner = Ipv4HeaderView::from_slice(inner_slice)
        .map_err(|_| EngineError::InvalidPacket("inner packet is not a valid IPv4 header"))?;

    if inner.header_len() != ip_packet::IPV4_HEADER_LEN {
        return Err(EngineError::InvalidPacket("inner header length is not 20 bytes"));
    }
    if inner.total_len() as usize != size {
        return Err(EngineError::InvalidPacket("inner total_len does not match bytes read"));
    }

    let tos = inner.tos();
    let dont_fragment = inner.dont_fragment();
    let inner_source = inner.source();
    let inner_destination = inner.destination();
    let ttl = inner.ttl();

    match ttl {
        0 => return Err(EngineError::PolicyDrop("inner ttl is zero")),
        1 => {
            icmp_emitter::send_icmpv4_error(
                v4_fd,
                config.local,
                inner_slice,
                icmp_emitter::ICMP_TIME_EXCEEDED,
                0,
            )?;
            return Err(EngineError::PolicyDrop("inner ttl expired, time-exceeded sent"));
        }
        _ => {}
    }

    {
        let inner_mut = &mut buf[ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size];
        let mut view = Ipv4HeaderViewMut::from_slice(inner_mut).expect("length already validated");
        view.set_ttl_decremented();
        view.stamp_checksum();
    }

    let destination = if config.remote().is_unspecified() {
        routes.lookup_v4(inner_destination)
    } else {
        config.remote()
    };

    if destination.is_unspecified() {
        let inner_slice = &buf[ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size];
        icmp_emitter::send_icmpv4_error(
            v4_fd,
            config.local,
            inner_slice,
            icmp_emitter::ICMP_DEST_UNREACH_HOST_UNKNOWN,
            0,
        )?;
        return Err(EngineError::NoRoute);
    }

    if destination == inner_source {
        return Err(EngineError::PolicyDrop("rfc2003 loopback guard"));
    }

    {
        let mut outer = Ipv4HeaderViewMut::from_slice(&mut buf[..ip_packet::IPV4_HEADER_LEN])
            .expect("buffer has a 20-byte prefix");
        outer.set_version_ihl(5);
        outer.set_tos(tos);
        outer.set_total_len(0);
        outer.set_identification(0);
        outer.set_flags_fragment_offset(if dont_fragment { DF_FLAG } else { 0 });
        outer.set_ttl(config.ttl);
        outer.set_protocol(crate::tunnel::decap::IPPROTO_IPIP);
        outer.set_source(config.local);
        outer.set_destination(destination);
        // checksum left at 0: IP_HDRINCL has the kernel fill it, same as
        // total_len and identification above.
    }

    icmp_emitter::transmit_v4(v4_fd, &buf[..ip_packet::IPV4_HEADER_LEN + size], destination)
}

/// Encapsulates an inner IPv6 packet at `buf[20..20 + size]` for 6-in-4
/// transport. `v4_fd` carries the encapsulated packet; `icmpv6_fd` is
/// the write-only raw IPv6 socket used for ICMPv6 error emission.
pub fn encap_v6(
    buf: &mut [u8],
    size: usize,
    config: &Config,
    routes: &RouteMirror,
    v4_fd: RawFd,
    icmpv6_fd: RawFd,
) -> Result<(), EngineError> {
    let inner_slice = buf
        .get(ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size)
        .ok_or(EngineError::InvalidPacket("buffer shorter than declared size"))?;

    let inner = Ipv6HeaderView::from_slice(inner_slice)
        .map_err(|_| EngineError::InvalidPacket("inner packet is not a valid IPv6 header"))?;

    if inner.payload_len() as usize != size - ip_packet::IPV6_HEADER_LEN {
        return Err(EngineError::InvalidPacket("inner payload_len does not match bytes read"));
    }

    let inner_destination = inner.destination();
    let hop_limit = inner.hop_limit();

    match hop_limit {
        0 => return Err(EngineError::PolicyDrop("inner hop limit is zero")),
        1 => {
            icmp_emitter::send_icmpv6_error(
                icmpv6_fd,
                config.local6,
                inner_slice,
                icmp_emitter::ICMPV6_TIME_EXCEEDED,
                0,
            )?;
            return Err(EngineError::PolicyDrop("inner hop limit expired, time-exceeded sent"));
        }
        _ => {}
    }

    {
        let inner_mut = &mut buf[ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size];
        let mut view = Ipv6HeaderViewMut::from_slice(inner_mut).expect("length already validated");
        view.set_hop_limit_decremented();
    }

    let destination = if config.remote().is_unspecified() {
        crate::route_mirror::unmap_v4_in_v6(routes.lookup_v6(inner_destination))
    } else {
        config.remote()
    };

    if destination.is_unspecified() {
        let inner_slice = &buf[ip_packet::IPV4_HEADER_LEN..ip_packet::IPV4_HEADER_LEN + size];
        icmp_emitter::send_icmpv6_error(
            icmpv6_fd,
            config.local6,
            inner_slice,
            icmp_emitter::ICMPV6_DEST_UNREACHABLE,
            0,
        )?;
        return Err(EngineError::NoRoute);
    }

    {
        let mut outer = Ipv4HeaderViewMut::from_slice(&mut buf[..ip_packet::IPV4_HEADER_LEN])
            .expect("buffer has a 20-byte prefix");
        outer.set_version_ihl(5);
        outer.set_tos(0);
        outer.set_total_len(0);
        outer.set_identification(0);
        outer.set_flags_fragment_offset(0);
        outer.set_ttl(config.ttl);
        outer.set_protocol(crate::tunnel::decap::IPPROTO_IP6IP);
        outer.set_source(config.local);
        outer.set_destination(destination);
        // checksum left at 0: IP_HDRINCL has the kernel fill it, same as
        // total_len and identification above.
    }

    icmp_emitter::transmit_v4(v4_fd, &buf[..ip_packet::IPV4_HEADER_LEN + size], destination)
}
