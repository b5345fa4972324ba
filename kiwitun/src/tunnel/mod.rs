//! The four forwarding paths: 4-in-4 and 6-in-4 encap/decap.

pub(crate) mod decap;
mod encap;

pub use decap::{decap_v4, decap_v6};
pub use encap::{encap_v4, encap_v6};
