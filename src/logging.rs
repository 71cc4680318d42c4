//! Structured logging bootstrap, opt-in and separate from library use.
//!
//! Mirrors the server's own bootstrap: an env-filter layered over a fmt
//! layer, defaulting to `info` with `sqlx` turned down to `warn` so routine
//! pool chatter doesn't drown out dispatch events.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global `tracing` subscriber. Call once, near the very top of
/// `main`. The core does not call this itself, since a library should never
/// install a process-wide subscriber on a caller's behalf.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,dispatch_core=debug,sqlx=warn".into()
        }))
        .with(fmt::layer())
        .init();
}
