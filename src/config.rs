//! Server configuration
//!
//! All settings come from `IPYBOX_*` environment variables with the
//! documented defaults. The binary builds its config from clap flags
//! whose `env =` fallbacks read the same variables; `from_env` serves
//! embedders that skip the CLI.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default Docker image used when a create request omits the tag.
pub const DEFAULT_TAG: &str = "ghcr.io/gradion-ai/ipybox";

/// Default idle-session timeout for MCP proxy sessions, seconds.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind the HTTP listener to.
    pub host: String,
    /// Port to bind the HTTP listener to.
    pub port: u16,
    /// Shared API key; `None` disables authentication entirely.
    pub api_key: Option<String>,
    /// Docker image tag used when container create requests omit one.
    pub default_tag: String,
    /// Period of the container and session reapers.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Containers idle longer than this are destroyed by the reaper.
    #[serde(with = "duration_secs")]
    pub max_idle_time: Duration,
    /// MCP sessions idle longer than this are stopped by the proxy reaper.
    #[serde(with = "duration_secs")]
    pub session_timeout: Duration,
    /// Allowed CORS origins; `["*"]` means any.
    pub cors_origins: Vec<String>,
    /// Log level name (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            api_key: None,
            default_tag: DEFAULT_TAG.to_string(),
            cleanup_interval: Duration::from_secs(300),
            max_idle_time: Duration::from_secs(3600),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            cors_origins: vec!["*".to_string()],
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from `IPYBOX_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_key = env::var("IPYBOX_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());

        let cors_origins = env::var("IPYBOX_CORS_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect::<Vec<_>>()
            })
            .ok()
            .filter(|origins| !origins.is_empty())
            .unwrap_or(defaults.cors_origins);

        Self {
            host: env::var("IPYBOX_HOST").unwrap_or(defaults.host),
            port: env_parse("IPYBOX_PORT", defaults.port),
            api_key,
            default_tag: env::var("IPYBOX_DEFAULT_TAG").unwrap_or(defaults.default_tag),
            cleanup_interval: Duration::from_secs(env_parse(
                "IPYBOX_CLEANUP_INTERVAL",
                defaults.cleanup_interval.as_secs(),
            )),
            max_idle_time: Duration::from_secs(env_parse(
                "IPYBOX_MAX_IDLE_TIME",
                defaults.max_idle_time.as_secs(),
            )),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            cors_origins,
            log_level: env::var("IPYBOX_LOG_LEVEL")
                .map(|level| level.to_lowercase())
                .unwrap_or(defaults.log_level),
        }
    }

    /// Whether CORS should allow any origin.
    pub fn cors_allow_any(&self) -> bool {
        self.cors_origins.iter().any(|origin| origin == "*")
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
