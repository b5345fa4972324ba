//! Error module.
use thiserror::Error;

/// The six causes the engine distinguishes when handling a packet or a
/// route-mirror event. Every per-packet variant is absorbed locally by
/// the reader that produced it; only [`EngineError::FatalIo`] during
/// initialization propagates to the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Version mismatch, header length mismatch, inconsistent length
    /// field, bad checksum, or insufficient data for ICMP construction.
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),

    /// TTL/hop-limit expiry, the RFC 2003 loopback guard, or a peer
    /// filter mismatch.
    #[error("policy drop: {0}")]
    PolicyDrop(&'static str),

    /// Route lookup returned the zero sentinel and no fixed peer is
    /// configured.
    #[error("no route to destination")]
    NoRoute,

    /// `EWOULDBLOCK`/`EAGAIN`, or a partial `send`/`write`.
    #[error("transient I/O error: {0}")]
    TransientIo(#[from] std::io::Error),

    /// A required socket or descriptor could not be created, or the
    /// route-mirror subscriber socket died.
    #[error("fatal I/O error: {0}")]
    FatalIo(String),

    /// Route-table growth failed; the insert is refused and the mirror
    /// stays stale until the next dump.
    #[error("route table allocation failure")]
    AllocFailure,
}

/// Failures specific to bringing the route mirror up.
#[derive(Error, Debug)]
pub enum RouteInitError {
    #[error("failed to open netlink socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("netlink dump request failed: {0}")]
    Dump(#[source] std::io::Error),

    #[error("failed to subscribe to route-change multicast groups: {0}")]
    Subscribe(#[source] std::io::Error),

    #[error("malformed netlink message: {0}")]
    Malformed(String),
}

impl From<&'static str> for EngineError {
    fn from(e: &'static str) -> Self {
        EngineError::InvalidPacket(e)
    }
}
