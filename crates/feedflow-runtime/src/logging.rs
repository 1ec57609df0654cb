//! Tracing bootstrap for hosts and test binaries

use tracing_subscriber::EnvFilter;

use feedflow_core::{FeedError, FeedResult};

/// Environment variable that overrides the configured filter
pub const LOG_ENV: &str = "FEEDFLOW_LOG";

/// Subscriber settings
#[derive(Clone, Debug)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `feedflow_runtime=debug`
    pub filter: String,
    /// Emit one JSON object per event
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Full engine trace, useful when chasing a reload loop
    pub fn verbose() -> Self {
        LoggingConfig {
            filter: "feedflow_runtime=trace,feedflow_operations=trace,feedflow_sync=debug"
                .to_string(),
            json: false,
        }
    }

    /// Filter to install, `FEEDFLOW_LOG` taking precedence
    pub fn effective_filter(&self) -> String {
        match std::env::var(LOG_ENV) {
            Ok(filter) if !filter.trim().is_empty() => filter,
            _ => self.filter.clone(),
        }
    }
}

/// Install the global fmt subscriber
///
/// Fails if the filter does not parse or a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> FeedResult<()> {
    let filter = EnvFilter::try_new(config.effective_filter())
        .map_err(|e| FeedError::Logging(e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| FeedError::Logging(e.to_string()))
}
