//! Subscriber setup.
//!
//! Log lines go to stderr so a bridge process can keep stdout for answers
//! while its parent relays stderr.

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Build the filter: `RUST_LOG` if set and valid, `default_filter` otherwise.
pub fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(default_filter: &str) -> bool {
    Registry::default()
        .with(filter(default_filter))
        .with(fmt::layer().with_writer(std::io::stderr).with_thread_names(true))
        .try_init()
        .is_ok()
}
