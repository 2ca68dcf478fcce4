// Logging infrastructure for ipybox-server
// Structured tracing with environment-based filtering

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging and tracing infrastructure.
/// This should be called once at application startup.
pub fn init_logging(level: &str) -> Result<()> {
    // Default: the configured level for ipybox_server, warnings for dependencies.
    // RUST_LOG, when set, overrides the configured level entirely.
    let default_filter = format!("ipybox_server={level},warn");

    let env_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
    } else {
        EnvFilter::new(default_filter)
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            tracing::info!("ipybox-server logging initialized at level {}", level);
            Ok(())
        }
        // Already initialized (tests call this repeatedly); not an error.
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        assert!(init_logging("info").is_ok());
        assert!(init_logging("debug").is_ok());
    }
}
