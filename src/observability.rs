//! Tracing initialization helpers.

use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber.
///
/// `BELAY_LOG` takes precedence when set (standard `EnvFilter` syntax);
/// otherwise the run verbosity picks a default level. Calling this more than
/// once keeps the first subscriber.
pub fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("BELAY_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
