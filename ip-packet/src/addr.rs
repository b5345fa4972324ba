//! Address comparison and mapping helpers shared by the route table and
//! the tunnel forwarding paths.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Bitwise AND of an IPv6 address against a netmask, word at a time.
pub fn ipv6_and(addr: &Ipv6Addr, mask: &Ipv6Addr) -> Ipv6Addr {
    let a = addr.octets();
    let m = mask.octets();
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] & m[i];
    }
    Ipv6Addr::from(out)
}

/// Bitwise AND of an IPv4 address against a netmask.
pub fn ipv4_and(addr: &Ipv4Addr, mask: &Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(*addr) & u32::from(*mask))
}

/// Big-endian, most-significant-byte-first ordering comparison, matching
/// the byte-wise signed comparison loop used for sorting IPv6 routes.
pub fn ipv6_compare(a: &Ipv6Addr, b: &Ipv6Addr) -> std::cmp::Ordering {
    a.octets().cmp(&b.octets())
}

/// Builds an IPv4-mapped IPv6 address (`::ffff:a.b.c.d`).
pub fn ipv4_mapped_to_ipv6(addr: Ipv4Addr) -> Ipv6Addr {
    addr.to_ipv6_mapped()
}

/// Extracts the IPv4 address carried in an IPv4-mapped IPv6 address, or
/// `None` if `addr` is not of that form.
pub fn unmap_ipv4_mapped_ipv6(addr: &Ipv6Addr) -> Option<Ipv4Addr> {
    addr.to_ipv4_mapped()
}

/// Turns a CIDR prefix length into an IPv4 netmask.
pub fn ipv4_prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    if prefix_len == 0 {
        return Ipv4Addr::UNSPECIFIED;
    }
    let bits = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(bits)
}

/// Turns a CIDR prefix length into an IPv6 netmask.
pub fn ipv6_prefix_to_mask(prefix_len: u8) -> Ipv6Addr {
    let mut out = [0u8; 16];
    let mut remaining = prefix_len as i32;
    for byte in out.iter_mut() {
        if remaining >= 8 {
            *byte = 0xff;
            remaining -= 8;
        } else if remaining > 0 {
            *byte = 0xffu8 << (8 - remaining);
            remaining = 0;
        } else {
            break;
        }
    }
    Ipv6Addr::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_masks_each_octet() {
        let addr: Ipv4Addr = "192.168.1.37".parse().unwrap();
        let mask: Ipv4Addr = "255.255.255.0".parse().unwrap();
        assert_eq!(ipv4_and(&addr, &mask), "192.168.1.0".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn prefix_to_mask_handles_zero_and_full() {
        assert_eq!(ipv4_prefix_to_mask(0), Ipv4Addr::UNSPECIFIED);
        assert_eq!(ipv4_prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(ipv4_prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
    }

    #[test]
    fn ipv6_prefix_to_mask_handles_partial_byte() {
        let mask = ipv6_prefix_to_mask(20);
        let octets = mask.octets();
        assert_eq!(octets[0], 0xff);
        assert_eq!(octets[1], 0xff);
        assert_eq!(octets[2], 0xf0);
        assert_eq!(octets[3], 0x00);
    }

    #[test]
    fn mapped_roundtrip() {
        let v4: Ipv4Addr = "10.0.0.1".parse().unwrap();
        let v6 = ipv4_mapped_to_ipv6(v4);
        assert_eq!(unmap_ipv4_mapped_ipv6(&v6), Some(v4));
        assert_eq!(unmap_ipv4_mapped_ipv6(&Ipv6Addr::LOCALHOST), None);
    }
}
