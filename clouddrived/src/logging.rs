use tracing_subscriber::{EnvFilter, fmt};

pub const LOG_ENV: &str = "CLOUDDRIVE_LOG";

/// Installs the global fmt subscriber. The filter comes from
/// `CLOUDDRIVE_LOG`, then `default_filter`. A second call is a no-op.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
