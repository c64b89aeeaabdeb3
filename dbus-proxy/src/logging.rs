//! Process-wide `tracing` subscriber installation (§10.1), mirroring the teacher's use
//! of `tracing` spans/events in its connection and socket code.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `log` mirrors the proxy's own `--log` flag (§3
/// `Proxy.log`): when it's false and `RUST_LOG` isn't set, only warnings and errors are
/// shown. `RUST_LOG` always takes precedence when present.
pub fn init(log: bool) {
    let default_directive = if log { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}
