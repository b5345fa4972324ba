//! Raw socket construction for the encap/decap paths.
//!
//! Three sockets, created on demand per enabled transport:
//! - protocol 4 (`IPPROTO_IPIP`) on `AF_INET`, for 4-in-4 RX and the
//!   ICMPv4 TX used by both transports.
//! - protocol 41 (`IPPROTO_IPV6`) on `AF_INET`, for 6-in-4 RX.
//! - `AF_INET6` raw, write-only, for ICMPv6 TX only.
//!
//! Mirrors `Ipip_init`, which builds the same three descriptors gated on
//! `config.tun4in4` / `config.tun6in4`.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};

use crate::tunnel::decap::{IPPROTO_IP6IP, IPPROTO_IPIP};

/// Raw sockets for one running transport configuration. A socket is
/// `None` when its transport isn't enabled.
pub struct RawSockets {
    pub v4: Option<Socket>,
    pub v6in4: Option<Socket>,
    pub icmpv6: Option<Socket>,
}

impl RawSockets {
    pub fn open(tun4in4: bool, tun6in4: bool) -> io::Result<Self> {
        let v4 = if tun4in4 {
            Some(open_hdrincl_v4(IPPROTO_IPIP as i32)?)
        } else {
            None
        };

        let v6in4 = if tun6in4 {
            Some(open_hdrincl_v4(IPPROTO_IP6IP as i32)?)
        } else {
            None
        };

        let icmpv6 = if tun6in4 { Some(open_raw_v6()?) } else { None };

        Ok(Self { v4, v6in4, icmpv6 })
    }

    pub fn v4_fd(&self) -> Option<RawFd> {
        self.v4.as_ref().map(Socket::as_raw_fd)
    }

    pub fn v6in4_fd(&self) -> Option<RawFd> {
        self.v6in4.as_ref().map(Socket::as_raw_fd)
    }

    pub fn icmpv6_fd(&self) -> Option<RawFd> {
        self.icmpv6.as_ref().map(Socket::as_raw_fd)
    }
}

fn open_hdrincl_v4(protocol: i32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(protocol)))?;
    socket.set_header_included_v4(true)?;
    Ok(socket)
}

fn open_raw_v6() -> io::Result<Socket> {
    // Write-only: used solely to emit ICMPv6 errors, never read from.
    let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?;
    socket.set_header_included_v6(true)?;
    Ok(socket)
}
