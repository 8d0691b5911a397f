//! Log setup.
//!
//! `RUST_LOG` wins if set; otherwise `MOLT_LOG_LEVEL` accepts either a bare
//! level (`debug`) or a full filter directive. `MOLT_LOG_FORMAT=json` switches
//! to JSON lines.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn default_filter() -> EnvFilter {
    EnvFilter::new("info,molt=debug,molt_daemon=debug")
}

fn build_log_filter() -> EnvFilter {
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
    }

    if let Ok(level_or_filter) = std::env::var("MOLT_LOG_LEVEL") {
        let level_or_filter = level_or_filter.trim();
        if !level_or_filter.is_empty() {
            let filter = if level_or_filter.contains('=') || level_or_filter.contains(',') {
                level_or_filter.to_string()
            } else {
                format!("{level},molt={level},molt_daemon={level}", level = level_or_filter)
            };
            return EnvFilter::try_new(filter).unwrap_or_else(|_| default_filter());
        }
    }

    default_filter()
}

/// Install the global subscriber.
pub fn init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let json = std::env::var("MOLT_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(build_log_filter())
        .with(fmt_layer)
        .try_init()?;

    Ok(())
}
