//! Process-wide tracing subscriber setup.
//!
//! Only the diagnostic binary and the UniFFI facade's first call need this;
//! a library consumer embedding `TransportManager` directly is expected to
//! have already installed its own subscriber. Safe to call more than once.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a `tracing_subscriber::fmt` subscriber driven by `RUST_LOG`
/// (defaulting to `info`). Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}
