//! End-to-end tests driving the task service facade.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use marquee::config::{EngineConfig, PoolConfig};
use marquee::error::{HandlerError, TaskError};
use marquee::store::{LibSqlBackend, TaskStore};
use marquee::tasks::{
    NewScheduledTask, NewTask, ProgressReporter, Task, TaskContext, TaskFilter, TaskHandler,
    TaskPriority, TaskService, TaskStatus, TaskTrigger,
};

// ── Helpers ──────────────────────────────────────────────────────────

fn fast_config() -> EngineConfig {
    EngineConfig {
        scheduler_interval: Duration::from_millis(50),
        cancel_poll_interval: Duration::from_millis(50),
        reconcile_interval: Duration::from_millis(50),
        stale_queued_after: Duration::ZERO,
        shutdown_grace: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

async fn service_with(config: EngineConfig) -> Arc<TaskService> {
    let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    Arc::new(TaskService::new(store, config).await)
}

async fn wait_for_status(service: &TaskService, id: i64, wanted: TaskStatus) -> Task {
    for _ in 0..300 {
        let task = service.get_task(id).await.unwrap();
        if task.status == wanted {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let task = service.get_task(id).await.unwrap();
    panic!("task {id} stuck in {} waiting for {wanted}", task.status);
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

struct Echo;

#[async_trait]
impl TaskHandler for Echo {
    fn name(&self) -> &str {
        "Echo"
    }
    fn description(&self) -> &str {
        "Reports completion and succeeds"
    }
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        progress.update(100.0, Some("done".to_string())).await;
        Ok(())
    }
}

/// Blocks until its context is cancelled.
struct WaitForCancel;

#[async_trait]
impl TaskHandler for WaitForCancel {
    fn name(&self) -> &str {
        "WaitForCancel"
    }
    fn description(&self) -> &str {
        "Runs until cancelled"
    }
    async fn execute(
        &self,
        ctx: &TaskContext,
        _task: &Task,
        _progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        ctx.cancelled().await;
        Err(HandlerError::Cancelled)
    }
}

struct Boom;

#[async_trait]
impl TaskHandler for Boom {
    fn name(&self) -> &str {
        "Boom"
    }
    fn description(&self) -> &str {
        "Panics"
    }
    async fn execute(
        &self,
        _ctx: &TaskContext,
        _task: &Task,
        _progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        panic!("boom");
    }
}

/// Holds every execution until released, tracking peak concurrency.
#[derive(Default)]
struct Gate {
    release: Notify,
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Gate {
    fn name(&self) -> &str {
        "Gate"
    }
    fn description(&self) -> &str {
        "Waits for release"
    }
    async fn execute(
        &self,
        ctx: &TaskContext,
        _task: &Task,
        _progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::select! {
            _ = self.release.notified() => {}
            _ = ctx.cancelled() => {}
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        ctx.checkpoint()
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_task_completes_with_timestamps() {
    let service = service_with(fast_config()).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    let task = service
        .queue_task(NewTask::new("Echo it", "Echo").with_priority(TaskPriority::parse_lossy("normal")))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);

    let done = wait_for_status(&service, task.id, TaskStatus::Completed).await;
    let started = done.started_at.expect("started_at");
    let ended = done.ended_at.expect("ended_at");
    assert!(started <= ended);
    assert_eq!(done.progress.unwrap().message.as_deref(), Some("done"));

    service.shutdown().await;
}

#[tokio::test]
async fn unregistered_command_fails() {
    let service = service_with(fast_config()).await;
    service.start().await.unwrap();

    let task = service
        .queue_task(NewTask::new("Nothing", "NoSuchHandler"))
        .await
        .unwrap();
    let failed = wait_for_status(&service, task.id, TaskStatus::Failed).await;
    assert!(failed.message.unwrap().contains("NoSuchHandler"));
    assert!(failed.progress.is_none());
    assert!(failed.ended_at.is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn cancel_running_task_aborts() {
    let service = service_with(fast_config()).await;
    service.register_handler(Arc::new(WaitForCancel)).await;
    service.start().await.unwrap();

    let task = service
        .queue_task(NewTask::new("Long", "WaitForCancel"))
        .await
        .unwrap();
    wait_for_status(&service, task.id, TaskStatus::Started).await;

    service.cancel_task(task.id).await.unwrap();
    let aborted = wait_for_status(&service, task.id, TaskStatus::Aborted).await;
    assert!(aborted.ended_at.is_some());

    let err = service.cancel_task(task.id).await.unwrap_err();
    assert!(matches!(err, TaskError::NotCancellable { .. }));

    service.shutdown().await;
}

#[tokio::test]
async fn cancel_seen_by_store_poll() {
    let service = service_with(fast_config()).await;
    service.register_handler(Arc::new(WaitForCancel)).await;
    service.start().await.unwrap();

    let task = service
        .queue_task(NewTask::new("Long", "WaitForCancel"))
        .await
        .unwrap();
    wait_for_status(&service, task.id, TaskStatus::Started).await;

    // flip the row directly, as another process would
    assert!(service.store().request_task_cancel(task.id).await.unwrap());
    wait_for_status(&service, task.id, TaskStatus::Aborted).await;

    service.shutdown().await;
}

#[tokio::test]
async fn cancel_while_waiting_for_a_slot_aborts_before_start() {
    let config = EngineConfig {
        default_pool: PoolConfig::new(1, 10),
        ..fast_config()
    };
    let service = service_with(config).await;
    service.register_handler(Arc::new(WaitForCancel)).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    let holder = service
        .queue_task(NewTask::new("Holds the slot", "WaitForCancel"))
        .await
        .unwrap();
    wait_for_status(&service, holder.id, TaskStatus::Started).await;
    let waiting = service.queue_task(NewTask::new("Waits", "Echo")).await.unwrap();

    let cancelling = service.cancel_task(waiting.id).await.unwrap();
    assert_eq!(cancelling.status, TaskStatus::Cancelling);

    // free the slot; the worker must resolve the waiting row without running it
    service.cancel_task(holder.id).await.unwrap();
    let aborted = wait_for_status(&service, waiting.id, TaskStatus::Aborted).await;
    assert!(aborted.started_at.is_none());
    assert!(aborted.ended_at.is_some());
    assert!(aborted.progress.is_none());
    assert_eq!(aborted.message.as_deref(), Some("Cancelled before start"));

    service.shutdown().await;
}

#[tokio::test]
async fn cancel_of_overflowed_task_aborts_immediately() {
    let config = EngineConfig {
        default_pool: PoolConfig::new(1, 1),
        ..fast_config()
    };
    let service = service_with(config).await;
    service.register_handler(Arc::new(WaitForCancel)).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    let holder = service
        .queue_task(NewTask::new("Holds the slot", "WaitForCancel"))
        .await
        .unwrap();
    wait_for_status(&service, holder.id, TaskStatus::Started).await;
    let queued = service.queue_task(NewTask::new("Fills the queue", "Echo")).await.unwrap();
    let dropped = service.queue_task(NewTask::new("Overflows", "Echo")).await.unwrap();

    let status = service.get_queue_status().await;
    assert_eq!(status["default"].queued_tasks, 1);

    // no pool holds the overflowed row, so cancellation resolves it directly
    let aborted = service.cancel_task(dropped.id).await.unwrap();
    assert_eq!(aborted.status, TaskStatus::Aborted);
    assert!(aborted.started_at.is_none());
    assert!(aborted.ended_at.is_some());

    service.cancel_task(holder.id).await.unwrap();
    wait_for_status(&service, queued.id, TaskStatus::Completed).await;
    assert_eq!(
        service.get_task(dropped.id).await.unwrap().status,
        TaskStatus::Aborted
    );

    service.shutdown().await;
}

#[tokio::test]
async fn panicking_handler_does_not_kill_pool() {
    let config = EngineConfig {
        default_pool: PoolConfig::new(1, 10),
        ..fast_config()
    };
    let service = service_with(config).await;
    service.register_handler(Arc::new(Boom)).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    let boom = service.queue_task(NewTask::new("Boom", "Boom")).await.unwrap();
    let failed = wait_for_status(&service, boom.id, TaskStatus::Failed).await;
    assert!(failed.message.unwrap().contains("boom"));

    let after = service.queue_task(NewTask::new("After", "Echo")).await.unwrap();
    wait_for_status(&service, after.id, TaskStatus::Completed).await;

    service.shutdown().await;
}

#[tokio::test]
async fn scheduled_task_spawns_runs() {
    let service = service_with(fast_config()).await;
    service.register_handler(Arc::new(Echo)).await;

    let scheduled = service
        .create_scheduled_task(NewScheduledTask::new(
            "Echo every second",
            "Echo",
            Duration::from_secs(1),
        ))
        .await
        .unwrap();
    service.start().await.unwrap();

    let mut last_next_run = scheduled.next_run;
    let mut advances = 0;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = service.get_scheduled_task(scheduled.id).await.unwrap();
        assert!(current.next_run >= last_next_run);
        if current.next_run > last_next_run {
            advances += 1;
            assert!(current.last_run.is_some());
            last_next_run = current.next_run;
        }
        if advances >= 2 {
            break;
        }
    }
    assert!(advances >= 1, "next_run never advanced");

    let runs = service
        .list_tasks(&TaskFilter {
            command_name: Some("Echo".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(runs.total >= 1);
    assert!(runs.tasks.iter().all(|t| t.trigger == TaskTrigger::Scheduled));

    service.shutdown().await;
}

#[tokio::test]
async fn overflow_loses_nothing_and_reconciler_drains() {
    let config = EngineConfig {
        default_pool: PoolConfig::new(1, 2),
        ..fast_config()
    };
    let service = service_with(config).await;
    service.register_handler(Arc::new(Echo)).await;

    // pools are not running yet, so everything past capacity is dropped
    let mut ids = Vec::new();
    for i in 0..8 {
        ids.push(
            service
                .queue_task(NewTask::new(format!("burst {i}"), "Echo"))
                .await
                .unwrap()
                .id,
        );
    }
    let page = service.list_tasks(&TaskFilter::default()).await.unwrap();
    assert_eq!(page.total, 8);
    assert!(page.tasks.iter().all(|t| t.status == TaskStatus::Queued));

    service.start().await.unwrap();
    for id in ids {
        wait_for_status(&service, id, TaskStatus::Completed).await;
    }

    service.shutdown().await;
}

// ── Properties ───────────────────────────────────────────────────────

#[tokio::test]
async fn priorities_route_to_their_pool() {
    let service = service_with(fast_config()).await;
    let gate = Arc::new(Gate::default());
    service.register_handler(gate.clone()).await;
    service.start().await.unwrap();

    let mut expected = Vec::new();
    for (priority, pool) in [
        ("high", "high-priority"),
        ("normal", "default"),
        ("low", "background"),
        ("", "default"),
    ] {
        let task = service
            .queue_task(
                NewTask::new(format!("p={priority}"), "Gate")
                    .with_priority(TaskPriority::parse_lossy(priority)),
            )
            .await
            .unwrap();
        expected.push((task.id, pool));
    }

    let svc = service.clone();
    wait_until(|| {
        let svc = svc.clone();
        async move {
            svc.get_queue_status()
                .await
                .values()
                .map(|s| s.active_workers)
                .sum::<usize>()
                == 4
        }
    })
    .await;

    let status = service.get_queue_status().await;
    for (id, pool) in expected {
        assert!(
            status[pool].active_task_ids.contains(&id),
            "task {id} not running on {pool}"
        );
    }

    gate.release.notify_waiters();
    service.shutdown().await;
}

#[tokio::test]
async fn pool_never_exceeds_max_workers() {
    let config = EngineConfig {
        default_pool: PoolConfig::new(2, 50),
        ..fast_config()
    };
    let service = service_with(config).await;
    let gate = Arc::new(Gate::default());
    service.register_handler(gate.clone()).await;
    service.start().await.unwrap();

    let mut ids = Vec::new();
    for i in 0..6 {
        ids.push(
            service
                .queue_task(NewTask::new(format!("gate {i}"), "Gate"))
                .await
                .unwrap()
                .id,
        );
    }

    // release in waves until every task is done
    for _ in 0..100 {
        let status = service.get_queue_status().await;
        assert!(status["default"].active_workers <= 2);
        gate.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let page = service
            .list_tasks(&TaskFilter {
                status: Some(TaskStatus::Completed),
                ..Default::default()
            })
            .await
            .unwrap();
        if page.total == ids.len() as u64 {
            break;
        }
    }

    for id in ids {
        assert_eq!(service.get_task(id).await.unwrap().status, TaskStatus::Completed);
    }
    assert!(gate.peak.load(Ordering::SeqCst) <= 2);

    service.shutdown().await;
}

#[tokio::test]
async fn queue_status_is_stable_without_mutation() {
    let service = service_with(fast_config()).await;
    let gate = Arc::new(Gate::default());
    service.register_handler(gate.clone()).await;
    service.start().await.unwrap();

    let task = service.queue_task(NewTask::new("held", "Gate")).await.unwrap();
    wait_for_status(&service, task.id, TaskStatus::Started).await;

    let first = service.get_queue_status().await;
    let second = service.get_queue_status().await;
    assert_eq!(first, second);
    assert_eq!(first["default"].active_task_ids, vec![task.id]);

    gate.release.notify_waiters();
    service.shutdown().await;
}

#[tokio::test]
async fn terminal_tasks_cannot_be_cancelled() {
    let service = service_with(fast_config()).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    let task = service.queue_task(NewTask::new("quick", "Echo")).await.unwrap();
    let done = wait_for_status(&service, task.id, TaskStatus::Completed).await;
    assert!(!done.can_be_cancelled());
    assert!(matches!(
        service.cancel_task(task.id).await,
        Err(TaskError::NotCancellable {
            status: TaskStatus::Completed,
            ..
        })
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn tasks_survive_restart_on_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("marquee.db");

    let queued_id = {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let service = TaskService::new(store, fast_config()).await;
        // never started: the row is only persisted
        service.queue_task(NewTask::new("later", "Echo")).await.unwrap().id
    };

    let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let service = TaskService::new(store, fast_config()).await;
    service.register_handler(Arc::new(Echo)).await;
    service.start().await.unwrap();

    wait_for_status(&service, queued_id, TaskStatus::Completed).await;
    service.shutdown().await;
}
