//! Container lifecycle manager
//!
//! Authoritative registry of live containers and their execution records.
//! All registry mutations are serialised under a single mutex; an idle
//! reaper destroys containers that have not been used within the
//! configured window. No execution record outlives its container.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::ServerError;
use crate::executor::CodeExecutor;
use crate::resources::ContainerResources;
use crate::runtime::{ContainerRuntime, ContainerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Running,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Running,
    Completed,
    Error,
}

/// Caller-visible snapshot of a container record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub tag: String,
    pub executor_port: u16,
    pub resource_port: u16,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub status: ContainerStatus,
}

/// Caller-visible snapshot of an execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub execution_id: String,
    pub container_id: String,
    pub status: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Live handle for operating on a container. Obtaining one through
/// [`ContainerManager::get`] renews the container's idle timer.
#[derive(Clone)]
pub struct ContainerHandle {
    pub id: String,
    pub executor_port: u16,
    pub resource_port: u16,
    pub executor: Arc<dyn CodeExecutor>,
    pub resources: Arc<dyn ContainerResources>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("id", &self.id)
            .field("executor_port", &self.executor_port)
            .field("resource_port", &self.resource_port)
            .finish_non_exhaustive()
    }
}

struct ContainerEntry {
    info: ContainerInfo,
    runtime_id: String,
    /// Monotonic twin of `info.last_used_at`, used for idle detection.
    last_used: Instant,
    executor: Arc<dyn CodeExecutor>,
    resources: Arc<dyn ContainerResources>,
}

impl ContainerEntry {
    fn touch(&mut self) {
        self.last_used = Instant::now();
        // Wall-clock timestamps stay monotonically non-decreasing even if
        // the system clock steps backwards.
        self.info.last_used_at = self.info.last_used_at.max(Utc::now());
    }

    fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            id: self.info.id.clone(),
            executor_port: self.info.executor_port,
            resource_port: self.info.resource_port,
            executor: Arc::clone(&self.executor),
            resources: Arc::clone(&self.resources),
        }
    }
}

#[derive(Default)]
struct ManagerState {
    containers: HashMap<String, ContainerEntry>,
    executions: HashMap<String, ExecutionStatus>,
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    cleanup_interval: Duration,
    max_idle_time: Duration,
    state: Mutex<ManagerState>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cleanup_interval: Duration,
        max_idle_time: Duration,
    ) -> Self {
        Self {
            runtime,
            cleanup_interval,
            max_idle_time,
            state: Mutex::new(ManagerState::default()),
            reaper: Mutex::new(None),
        }
    }

    /// Start a container and register it. On runtime failure nothing is
    /// registered.
    pub async fn create(&self, spec: ContainerSpec) -> Result<ContainerInfo, ServerError> {
        // Launching is slow; do it outside the registry lock.
        let launched = self.runtime.launch(&spec).await?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let info = ContainerInfo {
            id: id.clone(),
            tag: spec.tag.clone(),
            executor_port: launched.executor_port,
            resource_port: launched.resource_port,
            created_at: now,
            last_used_at: now,
            status: ContainerStatus::Running,
        };
        let entry = ContainerEntry {
            info: info.clone(),
            runtime_id: launched.runtime_id,
            last_used: Instant::now(),
            executor: launched.executor,
            resources: launched.resources,
        };

        let mut state = self.state.lock().await;
        state.containers.insert(id.clone(), entry);
        info!("container {} created from tag {}", id, spec.tag);
        Ok(info)
    }

    /// Look up a container and renew its idle timer. Every caller-visible
    /// operation routes through this; `info`/`list` deliberately do not.
    pub async fn get(&self, id: &str) -> Result<ContainerHandle, ServerError> {
        let mut state = self.state.lock().await;
        let entry = state
            .containers
            .get_mut(id)
            .ok_or_else(|| ServerError::NotFound(format!("Container {id} not found")))?;
        entry.touch();
        Ok(entry.handle())
    }

    /// Snapshot a container record without touching its idle timer.
    pub async fn info(&self, id: &str) -> Result<ContainerInfo, ServerError> {
        let state = self.state.lock().await;
        state
            .containers
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| ServerError::NotFound(format!("Container {id} not found")))
    }

    /// Snapshot all live container records; order unspecified.
    pub async fn list(&self) -> Vec<ContainerInfo> {
        let state = self.state.lock().await;
        state
            .containers
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Remove a container and everything it owns, then kill it. The
    /// record is gone even if the runtime kill fails; a second call
    /// returns `NotFound`.
    pub async fn destroy(&self, id: &str) -> Result<(), ServerError> {
        let runtime_id = {
            let mut state = self.state.lock().await;
            let mut entry = state
                .containers
                .remove(id)
                .ok_or_else(|| ServerError::NotFound(format!("Container {id} not found")))?;
            entry.info.status = ContainerStatus::Destroyed;
            // Executions are purged before the runtime kill is issued so a
            // concurrent status query observes NotFound, never stale state.
            state
                .executions
                .retain(|_, execution| execution.container_id != id);
            entry.runtime_id
        };

        info!("destroying container {}", id);
        self.runtime.terminate(&runtime_id).await?;
        Ok(())
    }

    /// Record a new execution owned by `container_id`.
    pub async fn register_execution(
        &self,
        container_id: &str,
        execution_id: &str,
    ) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        if !state.containers.contains_key(container_id) {
            return Err(ServerError::NotFound(format!(
                "Container {container_id} not found"
            )));
        }
        state.executions.insert(
            execution_id.to_string(),
            ExecutionStatus {
                execution_id: execution_id.to_string(),
                container_id: container_id.to_string(),
                status: ExecutionState::Running,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );
        Ok(())
    }

    /// Mark an execution terminal: `error` of `Some` means failure. A
    /// no-op when the record was already purged with its container.
    pub async fn complete_execution(&self, execution_id: &str, error: Option<String>) {
        let mut state = self.state.lock().await;
        if let Some(execution) = state.executions.get_mut(execution_id) {
            execution.status = if error.is_some() {
                ExecutionState::Error
            } else {
                ExecutionState::Completed
            };
            execution.completed_at = Some(Utc::now());
            execution.error = error;
        }
    }

    pub async fn execution_status(&self, execution_id: &str) -> Result<ExecutionStatus, ServerError> {
        let state = self.state.lock().await;
        state
            .executions
            .get(execution_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("Execution {execution_id} not found")))
    }

    /// Start the idle reaper. Destroys every container whose idle time
    /// exceeds `max_idle_time` on each pass.
    pub async fn start_reaper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.reap_idle().await;
            }
        });
        *self.reaper.lock().await = Some(handle);
    }

    async fn reap_idle(&self) {
        // Hold the lock only to snapshot the candidate list.
        let idle: Vec<String> = {
            let state = self.state.lock().await;
            state
                .containers
                .iter()
                .filter(|(_, entry)| entry.last_used.elapsed() > self.max_idle_time)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in idle {
            info!("reaping idle container {}", id);
            match self.destroy(&id).await {
                Ok(()) => {}
                // Already destroyed by a racing caller; nothing to do.
                Err(ServerError::NotFound(_)) => {}
                Err(err) => warn!("failed to reap container {}: {}", id, err),
            }
        }
    }

    pub async fn stop_reaper(&self) {
        if let Some(handle) = self.reaper.lock().await.take() {
            handle.abort();
        }
    }

    /// Stop the reaper and destroy every remaining container. Individual
    /// failures are logged and swallowed so one bad container cannot
    /// block teardown of the rest.
    pub async fn shutdown(&self) {
        self.stop_reaper().await;
        let ids: Vec<String> = {
            let state = self.state.lock().await;
            state.containers.keys().cloned().collect()
        };
        for id in ids {
            if let Err(err) = self.destroy(&id).await {
                error!("failed to destroy container {} during shutdown: {}", id, err);
            }
        }
    }
}
