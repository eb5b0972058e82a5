//! # Observability
//!
//! Structured logging for the smoke harness. Everything is emitted through
//! `tracing`; the subscriber writes human-readable lines by default and JSON
//! lines when `SMOKE_LOG_FORMAT=json`, which CI log collectors prefer.

use tracing_subscriber::EnvFilter;

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), json_logging: false }
    }
}

impl LoggingConfig {
    /// Read `SMOKE_LOG_FORMAT`; `verbose` lowers the default level to debug
    pub fn from_env(verbose: bool) -> Self {
        let json_logging = std::env::var("SMOKE_LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Self { log_level: if verbose { "debug" } else { "info" }.to_string(), json_logging }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.log_level))
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed (e.g. by a test
/// harness); that is not an error.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let builder = tracing_subscriber::fmt().with_env_filter(config.filter()).with_writer(std::io::stderr);

    let installed = if config.json_logging {
        builder.json().with_current_span(true).try_init()
    } else {
        builder.with_target(false).try_init()
    };
    installed.is_ok()
}
