//! stderr diagnostics for `bench` runs.
//!
//! Spans carry `task_id`, `worker_id` and `step_id`, so a filter such as
//! `RUST_LOG=kernel::controller=debug` follows one worker through its plan.
//! None of this reaches the report or the per-worker audit log; those are
//! written whatever the filter says.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "warn";

/// Install the global subscriber. Call once, before the first task runs.
pub fn init() {
    tracing_subscriber::registry()
        .with(filter_from(std::env::var("RUST_LOG").ok().as_deref()))
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .compact(),
        )
        .init();
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
