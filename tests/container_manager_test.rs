//! Container manager behavior: record lifecycle, idle-timer semantics,
//! destroy cascades and the reaper.

mod support;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pretty_assertions::assert_eq;

use ipybox_server::manager::{ContainerManager, ExecutionState};
use ipybox_server::runtime::ContainerSpec;
use ipybox_server::ServerError;
use support::FakeRuntime;

fn spec(tag: &str) -> ContainerSpec {
    ContainerSpec {
        tag: tag.to_string(),
        binds: HashMap::new(),
        env: HashMap::new(),
        executor_port: None,
        resource_port: None,
        show_pull_progress: false,
    }
}

fn manager(runtime: &Arc<FakeRuntime>) -> Arc<ContainerManager> {
    let runtime: Arc<dyn ipybox_server::runtime::ContainerRuntime> =
        Arc::clone(runtime) as Arc<dyn ipybox_server::runtime::ContainerRuntime>;
    Arc::new(ContainerManager::new(
        runtime,
        Duration::from_secs(300),
        Duration::from_secs(3600),
    ))
}

#[tokio::test]
async fn test_create_then_info_reports_consistent_timestamps() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);

    let created = manager.create(spec("ghcr.io/gradion-ai/ipybox")).await.unwrap();
    let info = manager.info(&created.id).await.unwrap();

    assert_eq!(info.id, created.id);
    assert_eq!(info.tag, "ghcr.io/gradion-ai/ipybox");
    assert!(info.created_at <= info.last_used_at);
    assert!(info.last_used_at <= Utc::now());
}

#[tokio::test]
async fn test_get_touches_last_used_but_info_does_not() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let created = manager.create(spec("tag")).await.unwrap();

    let before = manager.info(&created.id).await.unwrap().last_used_at;
    tokio::time::sleep(Duration::from_millis(15)).await;

    // info never advances the idle timer
    let untouched = manager.info(&created.id).await.unwrap().last_used_at;
    assert_eq!(untouched, before);

    manager.get(&created.id).await.unwrap();
    let touched = manager.info(&created.id).await.unwrap().last_used_at;
    assert!(touched > before);
}

#[tokio::test]
async fn test_get_unknown_container_is_not_found() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let err = manager.get("no-such-id").await.unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

#[tokio::test]
async fn test_list_returns_all_live_records() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let a = manager.create(spec("tag-a")).await.unwrap();
    let b = manager.create(spec("tag-b")).await.unwrap();

    let mut ids: Vec<String> = manager.list().await.into_iter().map(|c| c.id).collect();
    ids.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_destroy_cascades_and_is_not_repeatable() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let created = manager.create(spec("tag")).await.unwrap();

    manager
        .register_execution(&created.id, "exec-1")
        .await
        .unwrap();
    manager
        .register_execution(&created.id, "exec-2")
        .await
        .unwrap();

    manager.destroy(&created.id).await.unwrap();

    // The record and every owned execution are gone.
    assert!(matches!(
        manager.info(&created.id).await.unwrap_err(),
        ServerError::NotFound(_)
    ));
    assert!(matches!(
        manager.execution_status("exec-1").await.unwrap_err(),
        ServerError::NotFound(_)
    ));
    assert!(matches!(
        manager.execution_status("exec-2").await.unwrap_err(),
        ServerError::NotFound(_)
    ));

    // Second destroy: NotFound, and the runtime was not asked to kill twice.
    assert!(matches!(
        manager.destroy(&created.id).await.unwrap_err(),
        ServerError::NotFound(_)
    ));
    assert_eq!(runtime.terminated_ids().len(), 1);
}

#[tokio::test]
async fn test_destroy_reports_runtime_stop_failure_but_record_is_gone() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let created = manager.create(spec("tag")).await.unwrap();

    runtime.fail_stop.store(true, Ordering::SeqCst);
    let err = manager.destroy(&created.id).await.unwrap_err();
    assert!(matches!(err, ServerError::RuntimeStop(_)));

    // Best-effort teardown: no record leaks for a container we failed to kill.
    assert!(matches!(
        manager.info(&created.id).await.unwrap_err(),
        ServerError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_failed_create_registers_nothing() {
    let runtime = FakeRuntime::new();
    runtime.fail_start.store(true, Ordering::SeqCst);
    let manager = manager(&runtime);

    let err = manager.create(spec("tag")).await.unwrap_err();
    assert!(matches!(err, ServerError::RuntimeStart(_)));
    assert!(manager.list().await.is_empty());
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let created = manager.create(spec("tag")).await.unwrap();

    manager
        .register_execution(&created.id, "exec-1")
        .await
        .unwrap();
    let status = manager.execution_status("exec-1").await.unwrap();
    assert_eq!(status.status, ExecutionState::Running);
    assert_eq!(status.container_id, created.id);
    assert!(status.completed_at.is_none());

    manager.complete_execution("exec-1", None).await;
    let status = manager.execution_status("exec-1").await.unwrap();
    assert_eq!(status.status, ExecutionState::Completed);
    let completed_at = status.completed_at.expect("completed_at set");
    assert!(status.created_at <= completed_at);

    manager
        .register_execution(&created.id, "exec-2")
        .await
        .unwrap();
    manager
        .complete_execution("exec-2", Some("NameError".to_string()))
        .await;
    let status = manager.execution_status("exec-2").await.unwrap();
    assert_eq!(status.status, ExecutionState::Error);
    assert_eq!(status.error.as_deref(), Some("NameError"));
}

#[tokio::test]
async fn test_register_execution_for_unknown_container_fails() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    let err = manager
        .register_execution("no-such-id", "exec-1")
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::NotFound(_)));
}

#[tokio::test]
async fn test_reaper_destroys_idle_containers_and_spares_active_ones() {
    let runtime = FakeRuntime::new();
    let adapter: Arc<dyn ipybox_server::runtime::ContainerRuntime> =
        Arc::clone(&runtime) as Arc<dyn ipybox_server::runtime::ContainerRuntime>;
    let manager = Arc::new(ContainerManager::new(
        adapter,
        Duration::from_millis(50),
        Duration::from_millis(400),
    ));
    manager.start_reaper().await;

    let idle = manager.create(spec("idle")).await.unwrap();
    let active = manager.create(spec("active")).await.unwrap();

    // Keep one container busy while the other goes idle.
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.get(&active.id).await.unwrap();
    }

    assert!(matches!(
        manager.info(&idle.id).await.unwrap_err(),
        ServerError::NotFound(_)
    ));
    assert!(manager.info(&active.id).await.is_ok());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_everything_despite_failures() {
    let runtime = FakeRuntime::new();
    let manager = manager(&runtime);
    manager.create(spec("a")).await.unwrap();
    manager.create(spec("b")).await.unwrap();

    runtime.fail_stop.store(true, Ordering::SeqCst);
    manager.shutdown().await;

    assert!(manager.list().await.is_empty());
    assert_eq!(runtime.terminated_ids().len(), 2);
}
