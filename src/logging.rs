//! # Logging
//!
//! Structured logging via `tracing`. `RUST_LOG` takes precedence over the
//! verbosity flag.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Install the global subscriber. Subsequent calls are ignored.
pub fn init_logging(verbose: bool, json: bool) {
    INIT.call_once(|| {
        let default_level = if verbose { "debug" } else { "info" };
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

        let registry = tracing_subscriber::registry().with(env_filter);
        let result = if json {
            registry
                .with(fmt::layer().json().with_target(true).with_current_span(true))
                .try_init()
        } else {
            registry.with(fmt::layer().with_target(false)).try_init()
        };

        if let Err(err) = result {
            eprintln!("logging already initialised: {err}");
        }
    });
}
