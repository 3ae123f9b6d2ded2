//! Tracing subscriber setup
//!
//! `RUST_LOG` takes precedence over the configured level so a single run can
//! be turned up to `trace` (which logs raw wire traffic) without editing the
//! configuration file. Records emitted through the `log` facade are forwarded
//! by the subscriber's `tracing-log` bridge.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingSettings;

/// Filter for `settings`, overridden by `RUST_LOG` when it is set.
pub fn filter(settings: &LoggingSettings) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.level.to_ascii_lowercase()))
}

/// Install the global subscriber.
///
/// Returns false if a subscriber was already installed (for example by a
/// test harness); the existing one is left untouched.
pub fn init(settings: &LoggingSettings) -> bool {
    let builder = fmt().with_env_filter(filter(settings)).with_target(true);
    let result = if settings.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.is_ok()
}
