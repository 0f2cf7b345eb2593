use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Structured log output; `RUST_LOG` overrides the default filter.
pub fn init() {
    let fmt_layer = fmt::layer().with_target(true);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,querygate=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
