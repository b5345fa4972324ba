//! Wires the tun device, raw sockets, and route mirror together into
//! the reader threads that actually move packets.
//!
//! Mirrors `Ipip_start`: one thread reading the tun device and
//! dispatching to the encap paths, one thread per enabled raw socket
//! reading and dispatching to the matching decap path. Detached,
//! blocking OS threads rather than an event loop, matching the
//! original's one-thread-per-descriptor model.

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;

use crate::config::Config;
use crate::error::EngineError;
use crate::raw_socket::RawSockets;
use crate::route_mirror::RouteMirror;
use crate::tun_device::TunDevice;
use crate::tunnel;

const IP_MAX_PACKET_SIZE: usize = 65535;

/// The running set of reader threads. Dropping this does not stop the
/// threads (they hold their own `Arc`s); it is a handle for the caller
/// to block on via [`Engine::join`].
pub struct Engine {
    threads: Vec<thread::JoinHandle<()>>,
}

impl Engine {
    /// Brings up the tun device, raw sockets, and route mirror, then
    /// spawns one reader thread per enabled data path.
    pub fn start(config: Arc<Config>, interface_name: Option<&str>) -> Result<Self, EngineError> {
        let routes = Arc::new(RouteMirror::init().map_err(|e| EngineError::FatalIo(e.to_string()))?);

        let tun = Arc::new(
            TunDevice::create(interface_name)
                .map_err(|e| EngineError::FatalIo(format!("tun device creation failed: {e}")))?,
        );
        tracing::info!(name = tun.name(), "tunnel interface created");

        let sockets = Arc::new(
            RawSockets::open(config.tun4in4, config.tun6in4)
                .map_err(|e| EngineError::FatalIo(format!("raw socket creation failed: {e}")))?,
        );

        let mut threads = Vec::new();

        threads.push(spawn_tun_reader(
            Arc::clone(&config),
            Arc::clone(&routes),
            Arc::clone(&tun),
            Arc::clone(&sockets),
        ));

        if config.tun4in4 {
            threads.push(spawn_v4_socket_reader(
                Arc::clone(&config),
                Arc::clone(&tun),
                Arc::clone(&sockets),
            ));
        }

        if config.tun6in4 {
            threads.push(spawn_v6in4_socket_reader(
                Arc::clone(&config),
                Arc::clone(&tun),
                Arc::clone(&sockets),
            ));
        }

        tracing::info!("started successfully");
        Ok(Self { threads })
    }

    /// Blocks until every reader thread exits. Under normal operation
    /// they never do; this is for the caller to wait alongside signal
    /// handling rather than to expect a return.
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

fn spawn_tun_reader(
    config: Arc<Config>,
    routes: Arc<RouteMirror>,
    tun: Arc<TunDevice>,
    sockets: Arc<RawSockets>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tun-reader".into())
        .spawn(move || {
            let mut buf = vec![0u8; IP_MAX_PACKET_SIZE];
            loop {
                let read = unsafe {
                    libc::read(
                        tun.as_raw_fd(),
                        buf[ip_packet::IPV4_HEADER_LEN..].as_mut_ptr() as *mut libc::c_void,
                        buf.len() - ip_packet::IPV4_HEADER_LEN,
                    )
                };
                if read < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.kind() != std::io::ErrorKind::Interrupted {
                        tracing::error!(error = %err, "tunnel rx failed");
                    }
                    continue;
                }
                if read == 0 {
                    tracing::warn!("rx event with no data on tun device");
                    continue;
                }
                let size = read as usize;

                let version = buf[ip_packet::IPV4_HEADER_LEN] >> 4;
                let outcome = match version {
                    4 if config.tun4in4 => sockets
                        .v4_fd()
                        .ok_or(EngineError::NoRoute)
                        .and_then(|fd| tunnel::encap_v4(&mut buf, size, &config, &routes, fd)),
                    6 if config.tun6in4 => sockets
                        .v6in4_fd()
                        .zip(sockets.icmpv6_fd())
                        .ok_or(EngineError::NoRoute)
                        .and_then(|(v4_fd, icmpv6_fd)| {
                            tunnel::encap_v6(&mut buf, size, &config, &routes, v4_fd, icmpv6_fd)
                        }),
                    4 | 6 => continue, // transport not enabled for this packet's family
                    _ => continue,     // non-IP traffic
                };

                if let Err(err) = outcome {
                    tracing::debug!(%err, "packet from tunnel interface not forwarded");
                }
            }
        })
        .expect("tun-reader thread spawn should not fail")
}

fn spawn_v4_socket_reader(config: Arc<Config>, tun: Arc<TunDevice>, sockets: Arc<RawSockets>) -> thread::JoinHandle<()> {
    let fd = sockets.v4_fd().expect("tun4in4 enabled implies v4 socket exists");
    thread::Builder::new()
        .name("ipip-socket-reader".into())
        .spawn(move || run_decap_reader(fd, tun.as_raw_fd(), move |buf, size, tun_fd| {
            tunnel::decap_v4(buf, size, &config, tun_fd)
        }))
        .expect("ipip-socket-reader thread spawn should not fail")
}

fn spawn_v6in4_socket_reader(config: Arc<Config>, tun: Arc<TunDevice>, sockets: Arc<RawSockets>) -> thread::JoinHandle<()> {
    let fd = sockets.v6in4_fd().expect("tun6in4 enabled implies v6in4 socket exists");
    thread::Builder::new()
        .name("ip6ip-socket-reader".into())
        .spawn(move || run_decap_reader(fd, tun.as_raw_fd(), move |buf, size, tun_fd| {
            tunnel::decap_v6(buf, size, &config, tun_fd)
        }))
        .expect("ip6ip-socket-reader thread spawn should not fail")
}

fn run_decap_reader(socket_fd: RawFd, tun_fd: RawFd, decap: impl Fn(&[u8], usize, RawFd) -> Result<(), EngineError>) {
    let mut buf = vec![0u8; IP_MAX_PACKET_SIZE];
    loop {
        let read = unsafe { libc::recv(socket_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if read < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                tracing::error!(error = %err, "socket rx failed");
            }
            continue;
        }
        if read == 0 {
            tracing::warn!("rx event with no data on raw socket");
            continue;
        }
        if let Err(err) = decap(&buf, read as usize, tun_fd) {
            tracing::debug!(%err, "packet from raw socket not forwarded");
        }
    }
}

/// Resolves `config.remote` from a hostname once, and again every
/// `refresh_minutes` if non-zero. Mirrors `alarmHandler`, replacing
/// `SIGALRM` with a sleeping thread since there's no per-platform
/// itimer plumbing worth owning here.
pub fn spawn_hostname_resolver(hostname: String, refresh_minutes: u32, config: Arc<Config>) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("hostname-resolver".into())
        .spawn(move || loop {
            match resolve_ipv4(&hostname) {
                Ok(addr) => {
                    tracing::debug!(%hostname, %addr, "resolved tunnel peer hostname");
                    config.set_remote(addr);
                }
                Err(err) => tracing::warn!(%hostname, %err, "hostname resolution failed"),
            }

            if refresh_minutes == 0 {
                break;
            }
            thread::sleep(std::time::Duration::from_secs(u64::from(refresh_minutes) * 60));
        })
        .expect("hostname-resolver thread spawn should not fail")
}

fn resolve_ipv4(hostname: &str) -> std::io::Result<Ipv4Addr> {
    use std::net::ToSocketAddrs;

    (hostname, 0u16)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no A record found"))
}
