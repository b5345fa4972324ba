//! Global tracing subscriber setup.

use tracing_subscriber::{fmt, EnvFilter};

/// A filter directive that silences noisy crates before the user's own
/// directive is applied. `netlink_proto` shows up here even though we
/// talk to netlink with raw sockets, because `netlink-packet-route`
/// pulls it in transitively through shared dependencies.
const IRRELEVANT_CRATES: &str = "netlink_proto=warn";

/// Installs the process-wide subscriber. `directives` is the resolved
/// filter string (from `--log-level`, `--verbose`, or the default).
pub fn init(directives: &str) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))?;
    fmt().with_env_filter(filter).init();
    Ok(())
}
