//! Process-wide tracing subscriber setup.

use storex_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber for the host application.
///
/// `RUST_LOG` wins over the configured level when set. Returns `false` if a
/// global subscriber was already installed, in which case nothing changes.
pub fn init(config: &LoggingConfig) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(config))
        .with_target(true)
        .try_init()
        .is_ok()
}

fn filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
}

#[cfg(test)]
mod tests {
    use storex_test_utils::TestConfigBuilder;

    use super::*;

    #[test]
    fn test_second_init_is_rejected() {
        let config = TestConfigBuilder::new().log_level("warn").build().logging;
        init(&config);
        assert!(!init(&config));
    }
}
