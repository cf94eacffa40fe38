//! Tracing bootstrap for the terminal front end.
//!
//! Logs go to stderr; stdout carries the rendered chat.

use std::{env, io};

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,tertulia_terminal=debug,tertulia_sync=debug";

/// Install the global subscriber.
///
/// Filter precedence: `RUST_LOG`, `TERTULIA_TERMINAL_LOG`, `TERTULIA_LOG`, then
/// the built-in default.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    for key in ["TERTULIA_TERMINAL_LOG", "TERTULIA_LOG"] {
        if let Some(value) = env::var(key).ok().filter(|v| !v.trim().is_empty())
            && let Ok(filter) = EnvFilter::try_new(value)
        {
            return filter;
        }
    }

    EnvFilter::new(DEFAULT_FILTER)
}
