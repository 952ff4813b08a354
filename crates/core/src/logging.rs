use tracing_subscriber::EnvFilter;

use crate::error::GocpError;

/// Install the global fmt subscriber. `RUST_LOG` wins over `level`.
///
/// Calling this more than once is harmless: later calls report
/// [`GocpError::Logging`] and leave the first subscriber in place.
pub fn init_tracing(level: &str) -> Result<(), GocpError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| build_filter(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|error| GocpError::Logging(error.to_string()))
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_filter_falls_back_on_garbage() {
        let filter = build_filter("gocp=verbose");
        assert_eq!(filter.to_string(), "info");
    }

    #[test]
    fn build_filter_keeps_valid_level() {
        assert_eq!(build_filter("debug").to_string(), "debug");
    }

    #[test]
    fn second_init_reports_error() {
        let _ = init_tracing("info");
        assert!(init_tracing("debug").is_err());
    }
}
