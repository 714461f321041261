//! Logging initialization.

use tracing_subscriber::EnvFilter;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "tsgate=info,fanout=info,media_probe=info,process_utils=info";

/// Initialize the global tracing subscriber.
///
/// The filter comes from `RUST_LOG` when set, otherwise from
/// [`DEFAULT_LOG_FILTER`]; `debug` switches the default to debug level.
pub fn init_logging(debug: bool) {
    let default_filter = if debug {
        DEFAULT_LOG_FILTER.replace("info", "debug")
    } else {
        DEFAULT_LOG_FILTER.to_string()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
