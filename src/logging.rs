use std::sync::Once;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Install the tracing subscriber (stdout sink, `RUST_LOG`-style filtering).
///
/// Safe to call more than once; later calls are no-ops so tests can share it.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,pointledger=debug"));
        fmt().with_env_filter(filter).with_target(true).init();
    });
}
