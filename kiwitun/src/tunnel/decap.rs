//! socket-to-tun paths: validate a packet the kernel delivered with its
//! outer header intact and write the inner packet to the tun descriptor.

use std::os::fd::RawFd;

use ip_packet::{Ipv4HeaderView, Ipv6HeaderView};

use crate::config::Config;
use crate::error::EngineError;

pub(crate) const IPPROTO_IPIP: u8 = 4;
pub(crate) const IPPROTO_IP6IP: u8 = 41;

/// Validates and strips the outer header from a 4-in-4 packet delivered
/// on the protocol-4 raw socket, writing the inner packet to `tun_fd`.
pub fn decap_v4(buf: &[u8], size: usize, config: &Config, tun_fd: RawFd) -> Result<(), EngineError> {
    if size < 2 * ip_packet::IPV4_HEADER_LEN {
        return Err(EngineError::InvalidPacket("packet shorter than two IPv4 headers"));
    }

    let outer = Ipv4HeaderView::from_slice(&buf[..ip_packet::IPV4_HEADER_LEN])
        .map_err(|_| EngineError::InvalidPacket("outer header is not valid IPv4"))?;

    if !config.remote().is_unspecified() && outer.source() != config.remote() {
        return Err(EngineError::PolicyDrop("outer source does not match configured peer"));
    }
    if !config.local.is_unspecified() && outer.destination() != config.local {
        return Err(EngineError::PolicyDrop("outer destination does not match configured local"));
    }

    let inner = Ipv4HeaderView::from_slice(&buf[ip_packet::IPV4_HEADER_LEN..size])
        .map_err(|_| EngineError::InvalidPacket("inner header is not valid IPv4"))?;

    if !outer.verify_checksum() {
        return Err(EngineError::InvalidPacket("outer header checksum mismatch"));
    }
    if !inner.verify_checksum() {
        return Err(EngineError::InvalidPacket("inner header checksum mismatch"));
    }
    if outer.header_len() != ip_packet::IPV4_HEADER_LEN || inner.header_len() != ip_packet::IPV4_HEADER_LEN {
        return Err(EngineError::InvalidPacket("header length other than 20 bytes"));
    }
    if inner.ttl() == 0 {
        return Err(EngineError::PolicyDrop("inner ttl is zero"));
    }
    if inner.total_len() as usize != size - ip_packet::IPV4_HEADER_LEN {
        return Err(EngineError::InvalidPacket("inner total_len does not match bytes read"));
    }

    write_to_tun(tun_fd, &buf[ip_packet::IPV4_HEADER_LEN..size])
}

/// Validates and strips the outer header from a 6-in-4 packet delivered
/// on the protocol-41 raw socket, writing the inner packet to `tun_fd`.
pub fn decap_v6(buf: &[u8], size: usize, config: &Config, tun_fd: RawFd) -> Result<(), EngineError> {
    if size < ip_packet::IPV4_HEADER_LEN + ip_packet::IPV6_HEADER_LEN {
        return Err(EngineError::InvalidPacket("packet shorter than IPv4 + IPv6 headers"));
    }

    let outer = Ipv4HeaderView::from_slice(&buf[..ip_packet::IPV4_HEADER_LEN])
        .map_err(|_| EngineError::InvalidPacket("outer header is not valid IPv4"))?;

    if !config.remote().is_unspecified() && outer.source() != config.remote() {
        return Err(EngineError::PolicyDrop("outer source does not match configured peer"));
    }
    if !config.local.is_unspecified() && outer.destination() != config.local {
        return Err(EngineError::PolicyDrop("outer destination does not match configured local"));
    }

    let inner = Ipv6HeaderView::from_slice(&buf[ip_packet::IPV4_HEADER_LEN..size])
        .map_err(|_| EngineError::InvalidPacket("inner header is not valid IPv6"))?;

    if !outer.verify_checksum() {
        return Err(EngineError::InvalidPacket("outer header checksum mismatch"));
    }
    if outer.header_len() != ip_packet::IPV4_HEADER_LEN {
        return Err(EngineError::InvalidPacket("outer header length other than 20 bytes"));
    }
    if inner.hop_limit() == 0 {
        return Err(EngineError::PolicyDrop("inner hop limit is zero"));
    }
    if inner.payload_len() as usize != size - ip_packet::IPV4_HEADER_LEN - ip_packet::IPV6_HEADER_LEN {
        return Err(EngineError::InvalidPacket("inner payload_len does not match bytes read"));
    }

    write_to_tun(tun_fd, &buf[ip_packet::IPV4_HEADER_LEN..size])
}

fn write_to_tun(fd: RawFd, inner: &[u8]) -> Result<(), EngineError> {
    // Safety: `inner` is valid for `inner.len()` bytes for the duration
    // of the call.
    let written = unsafe { libc::write(fd, inner.as_ptr() as *const libc::c_void, inner.len()) };
    if written < 0 {
        return Err(EngineError::TransientIo(std::io::Error::last_os_error()));
    }
    if written as usize != inner.len() {
        return Err(EngineError::TransientIo(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "partial tun write",
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn stamped_ipv4(ttl: u8, total_len: u16) -> [u8; ip_packet::IPV4_HEADER_LEN] {
        let mut header = [0u8; ip_packet::IPV4_HEADER_LEN];
        let mut view = ip_packet::Ipv4HeaderViewMut::from_slice(&mut header).unwrap();
        view.set_version_ihl(5);
        view.set_total_len(total_len);
        view.set_ttl(ttl);
        view.set_source(Ipv4Addr::new(10, 0, 0, 2));
        view.set_destination(Ipv4Addr::new(10, 0, 0, 1));
        view.stamp_checksum();
        header
    }

    #[test]
    fn rejects_packet_shorter_than_two_headers() {
        let config = Config::new(true, false, Ipv4Addr::new(10, 0, 0, 1), 64);
        let buf = [0u8; 10];
        let err = decap_v4(&buf, buf.len(), &config, -1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPacket(_)));
    }

    #[test]
    fn peer_filter_rejects_mismatched_source() {
        let config = Config::new(true, false, Ipv4Addr::new(10, 0, 0, 1), 64);
        config.set_remote(Ipv4Addr::new(10, 0, 0, 9));

        let mut buf = vec![0u8; 2 * ip_packet::IPV4_HEADER_LEN];
        buf[..ip_packet::IPV4_HEADER_LEN].copy_from_slice(&stamped_ipv4(30, 20));
        let err = decap_v4(&buf, buf.len(), &config, -1).unwrap_err();
        assert!(matches!(err, EngineError::PolicyDrop(_)));
    }
}
