//! Userspace 4-in-4 / 6-in-4 IP tunneling engine.

pub mod config;
pub mod engine;
pub mod error;
pub mod icmp_emitter;
pub mod logging;
pub mod raw_socket;
pub mod route_mirror;
pub mod tun_device;
pub mod tunnel;

pub use config::{Cli, Config};
pub use engine::Engine;
pub use error::{EngineError, RouteInitError};
