//! Container runtime adapter
//!
//! Wraps the Docker CLI behind the [`ContainerRuntime`] contract: start a
//! sandbox container, report the host ports assigned to its executor and
//! resource services, and kill it on teardown. The container image and
//! the two in-container services are external collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::ServerError;
use crate::executor::{CodeExecutor, HttpExecutor};
use crate::resources::{ContainerResources, HttpResources};

/// In-container port of the executor service.
const EXECUTOR_PORT: u16 = 8080;
/// In-container port of the resource service.
const RESOURCE_PORT: u16 = 8900;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0}")]
    Start(String),

    #[error("{0}")]
    Stop(String),
}

impl From<RuntimeError> for ServerError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Start(detail) => ServerError::RuntimeStart(detail),
            RuntimeError::Stop(detail) => ServerError::RuntimeStop(detail),
        }
    }
}

/// Everything needed to start one sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub tag: String,
    /// Host path -> path below the container's work directory.
    pub binds: HashMap<String, String>,
    pub env: HashMap<String, String>,
    /// Explicit host port for the executor service; ephemeral if `None`.
    pub executor_port: Option<u16>,
    /// Explicit host port for the resource service; ephemeral if `None`.
    pub resource_port: Option<u16>,
    pub show_pull_progress: bool,
}

/// A running container with clients bound to its assigned host ports.
pub struct LaunchedContainer {
    pub runtime_id: String,
    pub executor_port: u16,
    pub resource_port: u16,
    pub executor: Arc<dyn CodeExecutor>,
    pub resources: Arc<dyn ContainerResources>,
}

/// Contract for starting and stopping sandbox containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn launch(&self, spec: &ContainerSpec) -> Result<LaunchedContainer, RuntimeError>;

    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError>;
}

/// Check whether the Docker daemon is reachable. Used as a preflight by
/// the binary before it starts serving.
pub async fn docker_available() -> bool {
    match Command::new("docker").arg("info").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// [`ContainerRuntime`] implementation driving the `docker` CLI.
pub struct DockerRuntime {
    /// Host on which published container ports are reachable.
    host: String,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
        }
    }

    async fn run_docker(&self, args: &[&str]) -> Result<String, String> {
        debug!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|err| format!("failed to invoke docker: {err}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(stderr.trim().to_string());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn image_present(&self, tag: &str) -> bool {
        self.run_docker(&["image", "inspect", tag]).await.is_ok()
    }

    async fn pull_image(&self, tag: &str, show_progress: bool) -> Result<(), String> {
        info!("pulling image {}", tag);
        if !show_progress {
            self.run_docker(&["pull", tag]).await?;
            return Ok(());
        }

        let mut child = Command::new("docker")
            .args(["pull", tag])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| format!("failed to invoke docker pull: {err}"))?;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                info!("pull {}: {}", tag, line);
            }
        }
        let status = child
            .wait()
            .await
            .map_err(|err| format!("docker pull did not exit cleanly: {err}"))?;
        if !status.success() {
            return Err(format!("docker pull of {tag} failed"));
        }
        Ok(())
    }

    /// Resolve the host port Docker assigned for a published container port.
    async fn assigned_port(&self, runtime_id: &str, container_port: u16) -> Result<u16, String> {
        let stdout = self
            .run_docker(&["port", runtime_id, &format!("{container_port}/tcp")])
            .await?;
        // Output is one `<ip>:<port>` mapping per line; the port is the same
        // for every address family.
        stdout
            .lines()
            .next()
            .and_then(|line| line.rsplit(':').next())
            .and_then(|port| port.trim().parse().ok())
            .ok_or_else(|| format!("could not parse docker port output: {stdout:?}"))
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn launch(&self, spec: &ContainerSpec) -> Result<LaunchedContainer, RuntimeError> {
        if !self.image_present(&spec.tag).await {
            self.pull_image(&spec.tag, spec.show_pull_progress)
                .await
                .map_err(RuntimeError::Start)?;
        }

        let executor_publish = match spec.executor_port {
            Some(port) => format!("{port}:{EXECUTOR_PORT}"),
            None => format!("0:{EXECUTOR_PORT}"),
        };
        let resource_publish = match spec.resource_port {
            Some(port) => format!("{port}:{RESOURCE_PORT}"),
            None => format!("0:{RESOURCE_PORT}"),
        };

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "-p".into(),
            executor_publish,
            "-p".into(),
            resource_publish,
        ];
        for (host_path, container_path) in &spec.binds {
            args.push("-v".into());
            args.push(format!("{host_path}:/app/{container_path}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.push(spec.tag.clone());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let runtime_id = self
            .run_docker(&arg_refs)
            .await
            .map_err(RuntimeError::Start)?;

        let executor_port = match self.assigned_port(&runtime_id, EXECUTOR_PORT).await {
            Ok(port) => port,
            Err(detail) => {
                // The container is up but unusable; do not leak it.
                if let Err(stop) = self.run_docker(&["rm", "-f", &runtime_id]).await {
                    warn!("failed to remove half-started container {}: {}", runtime_id, stop);
                }
                return Err(RuntimeError::Start(detail));
            }
        };
        let resource_port = match self.assigned_port(&runtime_id, RESOURCE_PORT).await {
            Ok(port) => port,
            Err(detail) => {
                if let Err(stop) = self.run_docker(&["rm", "-f", &runtime_id]).await {
                    warn!("failed to remove half-started container {}: {}", runtime_id, stop);
                }
                return Err(RuntimeError::Start(detail));
            }
        };

        info!(
            "started container {} (executor port {}, resource port {})",
            runtime_id, executor_port, resource_port
        );

        Ok(LaunchedContainer {
            runtime_id,
            executor_port,
            resource_port,
            executor: Arc::new(HttpExecutor::new(&self.host, executor_port)),
            resources: Arc::new(HttpResources::new(&self.host, resource_port)),
        })
    }

    async fn terminate(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.run_docker(&["rm", "-f", runtime_id])
            .await
            .map(|_| ())
            .map_err(RuntimeError::Stop)
    }
}
