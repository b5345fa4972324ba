//! In-memory shadow of the kernel's IPv4 and IPv6 routing tables.

mod netlink;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::AsRawFd;
use std::thread;

use netlink_packet_core::{NetlinkPayload, NLM_F_MULTI};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use parking_lot::Mutex;

use ip_packet::addr::{ipv4_and, ipv4_prefix_to_mask, ipv6_and, ipv6_compare, ipv6_prefix_to_mask};

use crate::error::RouteInitError;

const ROUTING_TABLE_BLOCK_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntryV4 {
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RouteEntryV6 {
    pub destination: Ipv6Addr,
    pub netmask: Ipv6Addr,
    pub gateway: Ipv6Addr,
}

struct RouteTableV4 {
    entries: Mutex<Vec<RouteEntryV4>>,
}

impl RouteTableV4 {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn load_all(&self, mut entries: Vec<RouteEntryV4>) {
        sort_v4(&mut entries);
        *self.entries.lock() = entries;
    }

    fn insert_and_resort(&self, entry: RouteEntryV4) {
        let mut entries = self.entries.lock();
        if entries.len() == entries.capacity() {
            entries.reserve(ROUTING_TABLE_BLOCK_SIZE);
        }
        entries.push(entry);
        sort_v4(&mut entries);
    }

    fn remove(&self, entry: &RouteEntryV4) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e == entry) {
            entries.remove(pos);
        }
    }

    fn lookup(&self, dest: Ipv4Addr) -> Ipv4Addr {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| ipv4_and(&dest, &e.netmask) == e.destination)
            .map(|e| e.gateway)
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    fn snapshot(&self) -> Vec<RouteEntryV4> {
        self.entries.lock().clone()
    }
}

struct RouteTableV6 {
    entries: Mutex<Vec<RouteEntryV6>>,
}

impl RouteTableV6 {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn load_all(&self, mut entries: Vec<RouteEntryV6>) {
        sort_v6(&mut entries);
        *self.entries.lock() = entries;
    }

    fn insert_and_resort(&self, entry: RouteEntryV6) {
        let mut entries = self.entries.lock();
        if entries.len() == entries.capacity() {
            entries.reserve(ROUTING_TABLE_BLOCK_SIZE);
        }
        entries.push(entry);
        sort_v6(&mut entries);
    }

    fn remove(&self, entry: &RouteEntryV6) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e == entry) {
            entries.remove(pos);
        }
    }

    fn lookup(&self, dest: Ipv6Addr) -> Ipv6Addr {
        let entries = self.entries.lock();
        entries
            .iter()
            .find(|e| ipv6_and(&dest, &e.netmask) == e.destination)
            .map(|e| e.gateway)
            .unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    fn snapshot(&self) -> Vec<RouteEntryV6> {
        self.entries.lock().clone()
    }
}

fn sort_v4(entries: &mut [RouteEntryV4]) {
    entries.sort_unstable_by(|a, b| {
        u32::from(b.netmask)
            .cmp(&u32::from(a.netmask))
            .then_with(|| u32::from(a.destination).cmp(&u32::from(b.destination)))
    });
}

fn sort_v6(entries: &mut [RouteEntryV6]) {
    entries.sort_unstable_by(|a, b| {
        b.netmask
            .octets()
            .cmp(&a.netmask.octets())
            .then_with(|| ipv6_compare(&a.destination, &b.destination))
    });
}

/// The live route mirror: two sorted tables plus the background
/// subscriber thread that keeps them current.
pub struct RouteMirror {
    v4: std::sync::Arc<RouteTableV4>,
    v6: std::sync::Arc<RouteTableV6>,
    _subscriber: thread::JoinHandle<()>,
}

impl RouteMirror {
    /// Dumps the kernel's v4 and v6 routing tables, sorts both, and
    /// starts the subscriber thread for incremental updates.
    pub fn init() -> Result<Self, RouteInitError> {
        let mut seq = 1u32;

        let v4_entries = dump_routes_v4(next(&mut seq))?;
        let v6_entries = dump_routes_v6(next(&mut seq))?;

        let v4 = std::sync::Arc::new(RouteTableV4::new());
        v4.load_all(v4_entries);
        let v6 = std::sync::Arc::new(RouteTableV6::new());
        v6.load_all(v6_entries);

        let (subscriber_socket, subscriber_pid) = netlink::open_subscriber_socket()?;
        let subscriber_v4 = v4.clone();
        let subscriber_v6 = v6.clone();

        let subscriber = thread::Builder::new()
            .name("route-mirror-subscriber".into())
            .spawn(move || subscribe_loop(subscriber_socket, subscriber_pid, subscriber_v4, subscriber_v6))
            .expect("failed to spawn route-mirror subscriber thread");

        Ok(Self {
            v4,
            v6,
            _subscriber: subscriber,
        })
    }

    pub fn lookup_v4(&self, dest: Ipv4Addr) -> Ipv4Addr {
        self.v4.lookup(dest)
    }

    pub fn lookup_v6(&self, dest: Ipv6Addr) -> Ipv6Addr {
        self.v6.lookup(dest)
    }

    pub fn snapshot_v4(&self) -> Vec<RouteEntryV4> {
        self.v4.snapshot()
    }

    pub fn snapshot_v6(&self) -> Vec<RouteEntryV6> {
        self.v6.snapshot()
    }
}

fn next(seq: &mut u32) -> u32 {
    let current = *seq;
    *seq = seq.wrapping_add(1);
    current
}

/// Long-lived reader for `RTM_NEWROUTE`/`RTM_DELROUTE` notifications.
/// Subscriber socket loss is fatal to the mirror per the engine's error
/// model: the tables simply stop updating and the tunnel keeps running
/// on whatever was last loaded plus any fixed peer.
fn subscribe_loop(
    fd: std::os::fd::OwnedFd,
    pid: u32,
    v4: std::sync::Arc<RouteTableV4>,
    v6: std::sync::Arc<RouteTableV6>,
) {
    use std::os::fd::AsRawFd;

    loop {
        let buf = match netlink::recv(fd.as_raw_fd()) {
            Ok(buf) => buf,
            Err(err) => {
                tracing::error!(%err, "route-mirror subscriber socket died, tables will go stale");
                return;
            }
        };

        for message in netlink::deserialize_all(&buf) {
            // Multicast notifications are addressed to nobody (port 0);
            // anything else must be addressed to us specifically.
            if message.header.port_number != 0 && message.header.port_number != pid {
                continue;
            }

            match message.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                    apply_new_route(&route, &v4, &v6);
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelRoute(route)) => {
                    apply_del_route(&route, &v4, &v6);
                }
                _ => {}
            }
        }
    }
}

fn apply_new_route(
    route: &netlink_packet_route::route::RouteMessage,
    v4: &RouteTableV4,
    v6: &RouteTableV6,
) {
    let Some(parsed) = netlink::parse_route(route) else {
        return;
    };
    match parsed.family {
        AddressFamily::Inet => {
            if let Some(entry) = to_entry_v4(&parsed) {
                v4.insert_and_resort(entry);
            }
        }
        AddressFamily::Inet6 => {
            if let Some(entry) = to_entry_v6(&parsed) {
                v6.insert_and_resort(entry);
            }
        }
        _ => {}
    }
}

fn apply_del_route(
    route: &netlink_packet_route::route::RouteMessage,
    v4: &RouteTableV4,
    v6: &RouteTableV6,
) {
    let Some(parsed) = netlink::parse_route(route) else {
        return;
    };
    match parsed.family {
        AddressFamily::Inet => {
            if let Some(entry) = to_entry_v4(&parsed) {
                v4.remove(&entry);
            }
        }
        AddressFamily::Inet6 => {
            if let Some(entry) = to_entry_v6(&parsed) {
                v6.remove(&entry);
            }
        }
        _ => {}
    }
}

fn to_entry_v4(parsed: &netlink::ParsedRoute) -> Option<RouteEntryV4> {
    let destination = parsed
        .destination
        .as_ref()
        .and_then(netlink::route_address_to_v4)?;
    if destination.is_unspecified() {
        return None;
    }
    let gateway = parsed
        .gateway
        .as_ref()
        .and_then(netlink::route_address_to_v4)
        .unwrap_or(Ipv4Addr::UNSPECIFIED);
    Some(RouteEntryV4 {
        destination,
        netmask: ipv4_prefix_to_mask(parsed.prefix_len),
        gateway,
    })
}

fn to_entry_v6(parsed: &netlink::ParsedRoute) -> Option<RouteEntryV6> {
    let destination = parsed
        .destination
        .as_ref()
        .and_then(netlink::route_address_to_v6)?;
    if destination.is_unspecified() {
        return None;
    }
    let gateway = parsed
        .gateway
        .as_ref()
        .and_then(netlink::route_address_to_v6)
        .unwrap_or(Ipv6Addr::UNSPECIFIED);
    Some(RouteEntryV6 {
        destination,
        netmask: ipv6_prefix_to_mask(parsed.prefix_len),
        gateway,
    })
}

/// Returns the embedded IPv4 address if and only if `addr` is an
/// IPv4-mapped IPv6 address (`::ffff:a.b.c.d`); otherwise the zero
/// sentinel.
pub fn unmap_v4_in_v6(addr: Ipv6Addr) -> Ipv4Addr {
    ip_packet::unmap_ipv4_mapped_ipv6(&addr).unwrap_or(Ipv4Addr::UNSPECIFIED)
}

fn dump_routes_v4(seq: u32) -> Result<Vec<RouteEntryV4>, RouteInitError> {
    let (fd, pid) = netlink::open_dump_socket(AddressFamily::Inet, seq)?;
    let mut entries = Vec::new();
    drain_dump(fd.as_raw_fd(), seq, pid, |parsed| {
        if parsed.family == AddressFamily::Inet {
            entries.extend(to_entry_v4(&parsed));
        }
    })?;
    Ok(entries)
}

fn dump_routes_v6(seq: u32) -> Result<Vec<RouteEntryV6>, RouteInitError> {
    let (fd, pid) = netlink::open_dump_socket(AddressFamily::Inet6, seq)?;
    let mut entries = Vec::new();
    drain_dump(fd.as_raw_fd(), seq, pid, |parsed| {
        if parsed.family == AddressFamily::Inet6 {
            entries.extend(to_entry_v6(&parsed));
        }
    })?;
    Ok(entries)
}

/// Drains a dump socket, invoking `on_route` for each parsed unicast
/// route, until a `NLMSG_DONE` message arrives or a non-multipart
/// message signals completion. Messages whose sequence number or port
/// ID don't match `seq`/`pid` are ignored.
fn drain_dump(
    fd: std::os::fd::RawFd,
    seq: u32,
    pid: u32,
    mut on_route: impl FnMut(netlink::ParsedRoute),
) -> Result<(), RouteInitError> {
    loop {
        let buf = netlink::recv(fd).map_err(RouteInitError::Dump)?;
        let messages = netlink::deserialize_all(&buf);
        if messages.is_empty() {
            return Err(RouteInitError::Malformed("empty netlink datagram".into()));
        }

        for message in &messages {
            if message.header.sequence_number != seq || message.header.port_number != pid {
                continue;
            }

            match &message.payload {
                NetlinkPayload::Done(_) => return Ok(()),
                NetlinkPayload::Error(err) => {
                    return Err(RouteInitError::Malformed(format!("{err:?}")));
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
                    if let Some(parsed) = netlink::parse_route(route) {
                        on_route(parsed);
                    }
                }
                _ => {}
            }

            if message.header.flags & NLM_F_MULTI == 0 {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_v4_orders_by_netmask_then_destination() {
        let mut entries = vec![
            RouteEntryV4 {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                gateway: Ipv4Addr::new(1, 1, 1, 1),
            },
            RouteEntryV4 {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(2, 2, 2, 2),
            },
            RouteEntryV4 {
                destination: Ipv4Addr::new(9, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                gateway: Ipv4Addr::new(3, 3, 3, 3),
            },
        ];
        sort_v4(&mut entries);
        assert_eq!(entries[0].netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(entries[1].destination, Ipv4Addr::new(9, 0, 0, 0));
        assert_eq!(entries[2].destination, Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn lookup_v4_picks_longest_prefix() {
        let table = RouteTableV4::new();
        table.load_all(vec![
            RouteEntryV4 {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 0, 0, 0),
                gateway: Ipv4Addr::new(1, 1, 1, 1),
            },
            RouteEntryV4 {
                destination: Ipv4Addr::new(10, 0, 0, 0),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                gateway: Ipv4Addr::new(2, 2, 2, 2),
            },
        ]);
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 0, 5)), Ipv4Addr::new(2, 2, 2, 2));
        assert_eq!(table.lookup(Ipv4Addr::new(10, 1, 0, 5)), Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(table.lookup(Ipv4Addr::new(11, 0, 0, 5)), Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn unmap_round_trips() {
        let v4 = Ipv4Addr::new(10, 0, 0, 2);
        let mapped = v4.to_ipv6_mapped();
        assert_eq!(unmap_v4_in_v6(mapped), v4);
        assert_eq!(unmap_v4_in_v6(Ipv6Addr::LOCALHOST), Ipv4Addr::UNSPECIFIED);
    }
}
