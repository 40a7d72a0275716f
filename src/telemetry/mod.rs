//! Tracing/logging bootstrap for the supervisor orchestration subsystem.
//!
//! Grounded in `weavegraph`'s demo binaries' `init_tracing`: an
//! `EnvFilter` layered with `tracing_subscriber::fmt` and
//! `tracing_error::ErrorLayer` so `#[instrument]`-scoped spans and
//! `miette`-style error chains both show up in the same subscriber.

use tracing_error::ErrorLayer;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide tracing subscriber. Honors `RUST_LOG`, falling
/// back to `info,wf_supervisor=info` when unset or invalid.
pub fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(false).with_line_number(false);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,wf_supervisor=info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init();
}

#[cfg(feature = "diagnostics")]
pub fn init_diagnostics() {
    miette::set_panic_hook();
}
