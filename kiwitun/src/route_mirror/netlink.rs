//! Blocking `AF_NETLINK`/`NETLINK_ROUTE` socket plumbing.
//!
//! We open and drive the sockets ourselves with raw `libc` calls rather
//! than `rtnetlink`'s async client, since the engine is specified as a
//! blocking-thread-per-reader model; `netlink-packet-route` and
//! `netlink-packet-core` are still used for typed message (de)serialization.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use netlink_packet_core::{NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteType};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};

use crate::error::RouteInitError;

pub const RTMGRP_IPV4_ROUTE: u32 = 0x40;
pub const RTMGRP_IPV6_ROUTE: u32 = 0x400;

/// A parsed route as carried by `RTM_NEWROUTE`/`RTM_DELROUTE`, before it
/// is split into the address-family-specific tables.
pub struct ParsedRoute {
    pub family: AddressFamily,
    pub prefix_len: u8,
    pub destination: Option<RouteAddress>,
    pub gateway: Option<RouteAddress>,
}

/// Opens a netlink socket and sends a one-shot `RTM_GETROUTE` dump
/// request for `family`, returning the raw fd plus the port ID the
/// kernel assigned it, so the caller can drain the multipart response
/// and filter replies addressed to some other socket.
pub fn open_dump_socket(family: AddressFamily, seq: u32) -> Result<(OwnedFd, u32), RouteInitError> {
    let fd = open_raw_socket().map_err(RouteInitError::SocketCreation)?;
    bind(fd.as_raw_fd(), 0, 0).map_err(RouteInitError::SocketCreation)?;
    let pid = bound_pid(fd.as_raw_fd()).map_err(RouteInitError::SocketCreation)?;

    let mut message = NetlinkMessage::new(
        NetlinkHeader::default(),
        NetlinkPayload::from(RouteNetlinkMessage::GetRoute(route_request(family))),
    );
    message.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
    message.header.sequence_number = seq;
    message.header.port_number = pid;
    message.finalize();

    let mut buf = vec![0u8; message.header.length as usize];
    message.serialize(&mut buf);

    send_all(fd.as_raw_fd(), &buf).map_err(RouteInitError::Dump)?;
    Ok((fd, pid))
}

/// Opens and binds a netlink socket to the route-change multicast groups
/// for both families, used for the long-lived subscriber reader. Returns
/// the assigned port ID alongside the fd for the same reason as
/// [`open_dump_socket`].
pub fn open_subscriber_socket() -> Result<(OwnedFd, u32), RouteInitError> {
    let fd = open_raw_socket().map_err(RouteInitError::SocketCreation)?;
    bind(fd.as_raw_fd(), 0, RTMGRP_IPV4_ROUTE | RTMGRP_IPV6_ROUTE)
        .map_err(RouteInitError::Subscribe)?;
    let pid = bound_pid(fd.as_raw_fd()).map_err(RouteInitError::Subscribe)?;
    Ok((fd, pid))
}

/// Blocking receive of one datagram into a fresh buffer.
pub fn recv(fd: RawFd) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; 1 << 16];
    loop {
        // Safety: `buf` is valid for `buf.len()` bytes for the duration
        // of the call.
        let n = unsafe {
            libc::recv(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf.truncate(n as usize);
        return Ok(buf);
    }
}

/// Splits a raw receive buffer into individual deserialized netlink
/// messages, tolerating a trailing partial message by stopping early.
pub fn deserialize_all(buf: &[u8]) -> Vec<NetlinkMessage<RouteNetlinkMessage>> {
    let mut messages = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
            Ok(message) => {
                let len = message.header.length as usize;
                if len == 0 {
                    break;
                }
                offset += len;
                messages.push(message);
            }
            Err(_) => break,
        }
    }
    messages
}

/// Extracts destination/gateway/prefix-length/type from a `RouteMessage`.
pub fn parse_route(route: &RouteMessage) -> Option<ParsedRoute> {
    if route.header.kind != RouteType::Unicast {
        return None;
    }

    let mut destination = None;
    let mut gateway = None;
    for attr in &route.attributes {
        match attr {
            RouteAttribute::Destination(addr) => destination = Some(addr.clone()),
            RouteAttribute::Gateway(addr) => gateway = Some(addr.clone()),
            _ => {}
        }
    }

    Some(ParsedRoute {
        family: route.header.address_family,
        prefix_len: route.header.destination_prefix_length,
        destination,
        gateway,
    })
}

pub fn route_address_to_v4(addr: &RouteAddress) -> Option<Ipv4Addr> {
    match addr {
        RouteAddress::Inet(v4) => Some(*v4),
        _ => None,
    }
}

pub fn route_address_to_v6(addr: &RouteAddress) -> Option<Ipv6Addr> {
    match addr {
        RouteAddress::Inet6(v6) => Some(*v6),
        _ => None,
    }
}

fn route_request(family: AddressFamily) -> RouteMessage {
    let mut message = RouteMessage::default();
    message.header.address_family = family;
    message
}

fn open_raw_socket() -> io::Result<OwnedFd> {
    // Safety: arguments are valid constants for a netlink socket.
    let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, libc::NETLINK_ROUTE) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: `fd` was just returned by a successful `socket` call and is
    // not otherwise owned.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn bind(fd: RawFd, pid: u32, groups: u32) -> io::Result<()> {
    let mut addr: libc::sockaddr_nl = unsafe { MaybeUninit::zeroed().assume_init() };
    addr.nl_family = libc::AF_NETLINK as u16;
    addr.nl_pid = pid;
    addr.nl_groups = groups;

    // Safety: `addr` is a valid, fully initialized `sockaddr_nl`.
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_nl>() as u32,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Reads back the port ID the kernel assigned `fd` at bind time, so
/// incoming messages can be matched against it.
fn bound_pid(fd: RawFd) -> io::Result<u32> {
    let mut addr: libc::sockaddr_nl = unsafe { MaybeUninit::zeroed().assume_init() };
    let mut len = std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;

    // Safety: `addr`/`len` describe a buffer sized for `sockaddr_nl`.
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr.nl_pid)
}

fn send_all(fd: RawFd, buf: &[u8]) -> io::Result<()> {
    // Safety: `buf` is valid for `buf.len()` bytes for the duration of
    // the call.
    let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n as usize != buf.len() {
        return Err(io::Error::new(io::ErrorKind::WriteZero, "partial netlink send"));
    }
    Ok(())
}
