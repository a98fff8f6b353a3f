//! Tracing setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSection;

/// Install the global subscriber. `RUST_LOG` wins over the configured filter.
///
/// Returns `false` if a subscriber was already installed.
pub fn init(logging: &LoggingSection) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        let logging = LoggingSection {
            filter: "docket=debug".into(),
        };
        init(&logging);
        assert!(!init(&logging));
    }
}
