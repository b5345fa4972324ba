//! Entry point: argument parsing, logging, daemonization, signal
//! handling, and wiring the engine together.
//!
//! Mirrors `main()` in `main.c`: parse args, require root, resolve the
//! remote hostname once up front, daemonize unless `--no-daemon`, bring
//! up the engine, then wait for a termination signal.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use kiwitun::config::{Cli, Config};
use kiwitun::{engine, logging, Engine};

fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.validate().map_err(anyhow::Error::msg)?;

    if !is_root() {
        bail!("kiwitun must be run as root");
    }

    if !cli.no_daemon {
        daemonize().context("daemonization failed")?;
    }

    logging::init(cli.tracing_filter()).map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    tracing::debug!(
        tun4in4 = cli.tun4in4,
        tun6in4 = cli.tun6in4,
        local = %cli.local,
        ttl = cli.ttl,
        refresh_minutes = cli.refresh_minutes,
        interface = cli.interface.as_deref().unwrap_or("not specified"),
        daemonized = !cli.no_daemon,
        "starting kiwitun",
    );

    let config = Arc::new(Config::new(cli.tun4in4, cli.tun6in4, cli.local, cli.ttl));

    let _resolver = match resolve_remote(&cli, &config)? {
        Some(hostname) => Some(engine::spawn_hostname_resolver(hostname, cli.refresh_minutes, Arc::clone(&config))),
        None => None,
    };

    let _engine = Engine::start(Arc::clone(&config), cli.interface.as_deref()).context("engine startup failed")?;

    wait_for_sigint()?;
    tracing::info!("terminating");

    Ok(())
}

/// `--remote` may be a literal address or a hostname. A literal parses
/// directly into `config.remote`; a hostname is resolved once here
/// (mirroring `alarmHandler(SIGALRM)` being called once at startup) and
/// its name returned so the caller can spawn the periodic-refresh
/// thread.
fn resolve_remote(cli: &Cli, config: &Config) -> Result<Option<String>> {
    let Some(remote) = cli.remote.as_deref() else {
        return Ok(None);
    };

    if let Ok(addr) = remote.parse::<Ipv4Addr>() {
        config.set_remote(addr);
        return Ok(None);
    }

    use std::net::ToSocketAddrs;
    let addr = (remote, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve remote hostname '{remote}'"))?
        .find_map(|a| match a.ip() {
            std::net::IpAddr::V4(v4) => Some(v4),
            std::net::IpAddr::V6(_) => None,
        })
        .with_context(|| format!("'{remote}' has no IPv4 address"))?;
    config.set_remote(addr);

    Ok(Some(remote.to_string()))
}

fn is_root() -> bool {
    // Safety: `getuid` takes no arguments and cannot fail.
    unsafe { libc::getuid() == 0 }
}

/// Classic double-fork daemonization, matching `daemonize()` in
/// `main.c`: detach from the controlling terminal, ignore `SIGCHLD`,
/// fork again so the daemon can never reacquire a controlling terminal,
/// then redirect the standard streams to `/dev/null`.
fn daemonize() -> Result<()> {
    // Safety: each of these is a well-understood libc call used in the
    // standard double-fork sequence; return values are checked below.
    unsafe {
        match libc::fork() {
            pid if pid < 0 => bail!("first fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }

        if libc::setsid() < 0 {
            bail!("setsid failed");
        }

        libc::signal(libc::SIGCHLD, libc::SIG_IGN);

        match libc::fork() {
            pid if pid < 0 => bail!("second fork failed"),
            0 => {}
            _ => std::process::exit(0),
        }

        libc::umask(0);
        let root = std::ffi::CString::new("/").expect("no NUL in literal");
        libc::chdir(root.as_ptr());

        redirect_standard_streams_to_dev_null();
    }

    Ok(())
}

/// # Safety
/// Must run after the second fork, before any other thread exists.
unsafe fn redirect_standard_streams_to_dev_null() {
    let dev_null = std::ffi::CString::new("/dev/null").expect("no NUL in literal");
    let fd = libc::open(dev_null.as_ptr(), libc::O_RDWR);
    if fd < 0 {
        return;
    }
    libc::dup2(fd, libc::STDIN_FILENO);
    libc::dup2(fd, libc::STDOUT_FILENO);
    libc::dup2(fd, libc::STDERR_FILENO);
    if fd > libc::STDERR_FILENO {
        libc::close(fd);
    }
}

fn wait_for_sigint() -> Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT])
        .context("failed to register SIGINT handler")?;
    signals.forever().next();
    Ok(())
}
