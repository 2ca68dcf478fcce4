// ipybox-server CLI - starts the HTTP control plane
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::info;

use ipybox_server::config::DEFAULT_TAG;
use ipybox_server::runtime::{docker_available, DockerRuntime};
use ipybox_server::{init_logging, serve, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "ipybox-server", about = "Sandboxed code execution server")]
struct Args {
    /// Host to bind the server to
    #[arg(long, env = "IPYBOX_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "IPYBOX_PORT", default_value_t = 8000)]
    port: u16,

    /// API key for authentication; empty disables authentication
    #[arg(long, env = "IPYBOX_API_KEY", default_value = "")]
    api_key: String,

    /// Default Docker image tag
    #[arg(long, env = "IPYBOX_DEFAULT_TAG", default_value = DEFAULT_TAG)]
    default_tag: String,

    /// Interval in seconds between cleanup passes
    #[arg(long, env = "IPYBOX_CLEANUP_INTERVAL", default_value_t = 300)]
    cleanup_interval: u64,

    /// Maximum idle time in seconds before a container is destroyed
    #[arg(long, env = "IPYBOX_MAX_IDLE_TIME", default_value_t = 3600)]
    max_idle_time: u64,

    /// Comma-separated list of allowed CORS origins
    #[arg(long, env = "IPYBOX_CORS_ORIGINS", default_value = "*")]
    cors_origins: String,

    /// Logging level
    #[arg(long, env = "IPYBOX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Path to a .env file loaded before the flags are parsed
    #[arg(long, default_value = ".env")]
    env_file: String,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            host: self.host,
            port: self.port,
            api_key: Some(self.api_key)
                .filter(|key| !key.trim().is_empty()),
            default_tag: self.default_tag,
            cleanup_interval: Duration::from_secs(self.cleanup_interval),
            max_idle_time: Duration::from_secs(self.max_idle_time),
            session_timeout: defaults.session_timeout,
            cors_origins: self
                .cors_origins
                .split(',')
                .map(|origin| origin.trim().to_string())
                .filter(|origin| !origin.is_empty())
                .collect(),
            log_level: self.log_level.to_lowercase(),
        }
    }
}

fn log_configuration(config: &ServerConfig) {
    info!("host:               {}", config.host);
    info!("port:               {}", config.port);
    info!(
        "api key:            {}",
        if config.api_key.is_some() {
            "enabled"
        } else {
            "disabled"
        }
    );
    info!("default tag:        {}", config.default_tag);
    info!("cleanup interval:   {}s", config.cleanup_interval.as_secs());
    info!("max idle time:      {}s", config.max_idle_time.as_secs());
    info!("cors origins:       {}", config.cors_origins.join(","));
    info!("log level:          {}", config.log_level);
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before clap reads the env fallbacks.
    if Path::new(".env").exists() {
        dotenvy::from_path(".env").ok();
    }
    let args = Args::parse();
    if args.env_file != ".env" && Path::new(&args.env_file).exists() {
        dotenvy::from_path(&args.env_file).ok();
    }

    let config = args.into_config();
    init_logging(&config.log_level)?;
    log_configuration(&config);

    if !docker_available().await {
        bail!("Docker is not available or not running. Install Docker and ensure it is running.");
    }

    serve(config, Arc::new(DockerRuntime::new())).await
}
