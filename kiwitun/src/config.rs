//! Command-line configuration surface.
//!
//! Mirrors the original tool's flag set one-to-one; this lives in the
//! binary crate, not the engine, since CLI parsing is an external
//! collaborator per the engine's contract.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "kiwitun",
    bin_name = "kiwitun",
    version,
    about = "Userspace 4-in-4 / 6-in-4 IP tunneling engine",
    long_about = None
)]
pub struct Cli {
    /// Enable 4-in-4 (IPv4-in-IPv4, RFC 2003) tunneling.
    #[arg(short = '4', long = "4in4")]
    pub tun4in4: bool,

    /// Enable 6-in-4 (IPv6-in-IPv4, RFC 4213) tunneling.
    #[arg(short = '6', long = "6in4")]
    pub tun6in4: bool,

    /// Fixed remote tunnel endpoint, as an address or hostname. Omit to
    /// let the route mirror pick the outer destination per packet.
    #[arg(short = 'r', long = "remote")]
    pub remote: Option<String>,

    /// Local address to place in the outer IPv4 header. Omit to let the
    /// kernel fill it in.
    #[arg(short = 'l', long = "local", default_value = "0.0.0.0")]
    pub local: Ipv4Addr,

    /// Outer IPv4 TTL for encapsulated packets.
    #[arg(short = 't', long = "ttl", default_value_t = 64)]
    pub ttl: u8,

    /// Minutes between re-resolving `--remote` when it names a hostname.
    /// 0 disables periodic refresh.
    #[arg(long = "refresh", default_value_t = 60)]
    pub refresh_minutes: u32,

    /// Tun interface name. Omit for kernel-chosen naming.
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Stay in the foreground instead of daemonizing.
    #[arg(short = 'd', long = "no-daemon")]
    pub no_daemon: bool,

    /// Verbose output; shorthand for `--log-level=debug`.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Explicit log level (error, warn, info, debug, trace). Overrides
    /// `--verbose` if both are given.
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

impl Cli {
    /// `-4`/`-6` mirrors the original: at least one transport must be
    /// enabled, checked after parsing rather than via a clap group so
    /// the error message can name both flags explicitly.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.tun4in4 && !self.tun6in4 {
            return Err("at least one of --4in4 or --6in4 must be given");
        }
        Ok(())
    }

    pub fn tracing_filter(&self) -> &str {
        match self.log_level.as_deref() {
            Some(level) => level,
            None if self.verbose => "debug",
            None => "info",
        }
    }
}

/// Runtime configuration shared with the engine. `remote` is the one
/// field the hostname-resolver thread mutates after startup; it is
/// stored as a packed `u32` (network-order `Ipv4Addr` bits) behind an
/// `AtomicU32` so readers never need to lock to observe it, matching
/// the "4-byte address write is atomic" assumption the engine is
/// specified against.
#[derive(Debug)]
pub struct Config {
    pub tun4in4: bool,
    pub tun6in4: bool,
    pub local: Ipv4Addr,
    pub local6: std::net::Ipv6Addr,
    pub ttl: u8,
    remote: Arc<AtomicU32>,
}

impl Config {
    pub fn new(tun4in4: bool, tun6in4: bool, local: Ipv4Addr, ttl: u8) -> Self {
        Self {
            tun4in4,
            tun6in4,
            local,
            local6: std::net::Ipv6Addr::UNSPECIFIED,
            ttl,
            remote: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn remote(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.remote.load(Ordering::Relaxed))
    }

    pub fn set_remote(&self, addr: Ipv4Addr) {
        self.remote.store(u32::from(addr), Ordering::Relaxed);
    }

    /// A cheap handle the hostname-resolver thread can hold independently
    /// of the rest of `Config`.
    pub fn remote_handle(&self) -> Arc<AtomicU32> {
        self.remote.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_round_trips_through_the_atomic() {
        let config = Config::new(true, false, Ipv4Addr::UNSPECIFIED, 64);
        assert_eq!(config.remote(), Ipv4Addr::UNSPECIFIED);
        config.set_remote(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.remote(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn validate_rejects_no_transport() {
        let cli = Cli {
            tun4in4: false,
            tun6in4: false,
            remote: None,
            local: Ipv4Addr::UNSPECIFIED,
            ttl: 64,
            refresh_minutes: 60,
            interface: None,
            no_daemon: false,
            verbose: false,
            log_level: None,
        };
        assert!(cli.validate().is_err());
    }
}
