//! Minimal, bounds-checked views over IPv4/IPv6/ICMP packet bytes.
//!
//! These types do not own or allocate packet buffers; they borrow a
//! `&[u8]`/`&mut [u8]` and validate only what is needed to read or write
//! the fields they expose.

pub mod addr;
pub mod checksum;
pub mod icmp;
pub mod v4;
pub mod v6;

pub use addr::{ipv4_mapped_to_ipv6, unmap_ipv4_mapped_ipv6};
pub use checksum::inet_checksum;
pub use icmp::{Icmpv4ViewMut, Icmpv6ViewMut};
pub use v4::{Ipv4HeaderView, Ipv4HeaderViewMut, IPV4_HEADER_LEN};
pub use v6::{Ipv6HeaderView, Ipv6HeaderViewMut, IPV6_HEADER_LEN};

/// Errors returned when constructing a header view over a byte slice.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("slice is too short: need at least {needed} bytes, got {got}")]
    TooShort { needed: usize, got: usize },
    #[error("unexpected IP version: expected {expected}, got {got}")]
    UnsupportedVersion { expected: u8, got: u8 },
    #[error("IPv4 header length field ({ihl} words) does not match a 20-byte header")]
    BadHeaderLength { ihl: u8 },
}
