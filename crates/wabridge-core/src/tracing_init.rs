//! Shared tracing/logging initialization.
//!
//! The daemon and the maintenance subcommands use the same pattern for setting
//! up `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"wabridge_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Build the default filter directive for the wabridge crates at `level`.
///
/// Dependencies such as `sqlx` stay at `warn` so per-query logging does not
/// drown the reclaimer and pool events.
pub fn wabridge_filter(level: &str) -> String {
    format!("warn,wabridge_core={level},wabridge_daemon={level}")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn filter_covers_both_crates() {
        let filter = wabridge_filter("debug");
        assert!(filter.contains("wabridge_core=debug"));
        assert!(filter.contains("wabridge_daemon=debug"));
        assert!(filter.starts_with("warn,"));
    }
}
