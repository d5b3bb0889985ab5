//! Worker pools — bounded execution slots fed by a bounded inbound queue.
//!
//! Each pool runs one loop that acquires a slot, pulls the next task
//! (FIFO) and spawns its execution. Execution follows a fixed protocol:
//! pre-flight status check, `started`, handler lookup, cancellation
//! monitor, panic-safe handler call, final status.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::PoolConfig;
use crate::error::HandlerError;
use crate::store::TaskStore;
use crate::tasks::handler::{HandlerRegistry, ProgressReporter, TaskContext};
use crate::tasks::model::{Task, TaskPriority, TaskStatus};

/// The three priority classes a task can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolKind {
    HighPriority,
    Default,
    Background,
}

impl PoolKind {
    pub const ALL: [PoolKind; 3] = [Self::HighPriority, Self::Default, Self::Background];

    /// Total routing function from priority to pool.
    pub fn for_priority(priority: TaskPriority) -> Self {
        match priority {
            TaskPriority::High => Self::HighPriority,
            TaskPriority::Normal => Self::Default,
            TaskPriority::Low => Self::Background,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighPriority => "high-priority",
            Self::Default => "default",
            Self::Background => "background",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a non-blocking enqueue was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("inbound queue is full")]
    QueueFull,
    #[error("pool is shut down")]
    Closed,
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_workers: usize,
    pub active_workers: usize,
    pub queued_tasks: usize,
    pub active_task_ids: Vec<i64>,
}

struct PoolInner {
    kind: PoolKind,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    cancel_poll_interval: Duration,
    slots: Arc<Semaphore>,
    /// Running task ids, each with the token its handler observes.
    active: RwLock<HashMap<i64, CancellationToken>>,
    /// Ids sitting in the inbound queue.
    pending: Mutex<HashSet<i64>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// A bounded pool of workers serving one priority class.
pub struct WorkerPool {
    max_workers: usize,
    tx: mpsc::Sender<Task>,
    rx: Mutex<Option<mpsc::Receiver<Task>>>,
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool. Nothing runs until [`WorkerPool::start`]; tasks
    /// offered before that wait in the inbound queue.
    pub fn new(
        kind: PoolKind,
        config: PoolConfig,
        store: Arc<dyn TaskStore>,
        handlers: Arc<HandlerRegistry>,
        cancel_poll_interval: Duration,
    ) -> Self {
        let max_workers = config.max_workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            max_workers,
            tx,
            rx: Mutex::new(Some(rx)),
            inner: Arc::new(PoolInner {
                kind,
                store,
                handlers,
                cancel_poll_interval,
                slots: Arc::new(Semaphore::new(max_workers)),
                active: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn kind(&self) -> PoolKind {
        self.inner.kind
    }

    /// Spawn the run loop. Returns `false` if it was already started.
    pub async fn start(&self) -> bool {
        let Some(rx) = self.rx.lock().await.take() else {
            return false;
        };
        let inner = self.inner.clone();
        self.inner.tracker.spawn(run_loop(inner, rx));
        tracing::info!(
            pool = %self.inner.kind,
            max_workers = self.max_workers,
            "Worker pool started"
        );
        true
    }

    /// Offer a task without blocking.
    pub async fn try_enqueue(&self, task: Task) -> Result<(), EnqueueError> {
        let id = task.id;
        let mut pending = self.inner.pending.lock().await;
        if self.inner.shutdown.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        match self.tx.try_send(task) {
            Ok(()) => {
                pending.insert(id);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(EnqueueError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Fire the cancellation token of a running task. Returns whether the
    /// task is running on this pool.
    pub async fn cancel(&self, task_id: i64) -> bool {
        match self.inner.active.read().await.get(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether the task is waiting in the queue or running on this pool.
    pub async fn is_tracking(&self, task_id: i64) -> bool {
        // pending before active: execution inserts into active first
        self.inner.pending.lock().await.contains(&task_id)
            || self.inner.active.read().await.contains_key(&task_id)
    }

    pub async fn status(&self) -> PoolStatus {
        let queued_tasks = self.inner.pending.lock().await.len();
        let active = self.inner.active.read().await;
        let mut active_task_ids: Vec<i64> = active.keys().copied().collect();
        active_task_ids.sort_unstable();
        PoolStatus {
            max_workers: self.max_workers,
            active_workers: active.len(),
            queued_tasks,
            active_task_ids,
        }
    }

    /// Stop taking work and cancel every running task. Tasks still in the
    /// inbound queue are dropped; their rows stay `queued` for recovery.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        // never started, so no run loop will release the queue
        if self.rx.lock().await.take().is_some() {
            self.inner.pending.lock().await.clear();
        }
    }

    /// Wait for the run loop and in-flight executions to finish.
    /// Returns `false` if `grace` elapsed first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok()
    }
}

async fn run_loop(inner: Arc<PoolInner>, mut rx: mpsc::Receiver<Task>) {
    loop {
        let permit = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let task = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            task = rx.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        let worker = inner.clone();
        inner.tracker.spawn(async move { worker.execute(task, permit).await });
    }
    drop(rx);
    inner.pending.lock().await.clear();
    tracing::debug!(pool = %inner.kind, "Worker pool loop stopped");
}

impl PoolInner {
    async fn execute(&self, task: Task, permit: OwnedSemaphorePermit) {
        let id = task.id;
        let token = self.shutdown.child_token();
        self.active.write().await.insert(id, token.clone());
        self.pending.lock().await.remove(&id);

        self.run_task(task, token).await;

        // release the active entry before the slot so the count never overshoots
        self.active.write().await.remove(&id);
        drop(permit);
    }

    async fn run_task(&self, mut task: Task, token: CancellationToken) {
        let id = task.id;

        if !self.preflight(id).await {
            return;
        }

        match self.store.mark_task_started(id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                // cancelled (or taken) between the pre-flight read and now
                self.preflight(id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = id, "Failed to persist started status: {e}");
            }
        }
        if let Err(e) = task.transition_to(TaskStatus::Started, None) {
            tracing::debug!(task_id = id, "{e}");
        }

        let Some(handler) = self.handlers.get(&task.command_name).await else {
            let message = format!(
                "No handler registered for command '{}'",
                task.command_name
            );
            tracing::warn!(task_id = id, command = %task.command_name, "{message}");
            self.finish(&mut task, TaskStatus::Failed, Some(message))
                .await;
            return;
        };

        tracing::info!(
            task_id = id,
            pool = %self.kind,
            command = %task.command_name,
            "Task started"
        );

        let progress = ProgressReporter::new(id, self.store.clone());
        let ctx = TaskContext::new(id, token.clone());
        let monitor = self.spawn_cancel_monitor(id, token);

        let outcome = AssertUnwindSafe(handler.execute(&ctx, &task, &progress))
            .catch_unwind()
            .await;
        monitor.abort();

        let (status, message) = match outcome {
            Ok(Ok(())) => (TaskStatus::Completed, None),
            Ok(Err(HandlerError::Cancelled)) => {
                (TaskStatus::Aborted, Some("Task was cancelled".to_string()))
            }
            Ok(Err(e)) => (TaskStatus::Failed, Some(e.to_string())),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task_id = id, command = %task.command_name, "Handler panicked: {message}");
                (TaskStatus::Failed, Some(format!("Handler panicked: {message}")))
            }
        };
        self.finish(&mut task, status, message).await;
    }

    /// Re-read the row before running. Returns `true` if it is still
    /// `queued`; a `cancelling` row is resolved to `aborted` here.
    async fn preflight(&self, id: i64) -> bool {
        match self.store.get_task_status(id).await {
            Ok(Some(TaskStatus::Queued)) => true,
            Ok(Some(TaskStatus::Cancelling)) => {
                if let Err(e) = self
                    .store
                    .finish_task(
                        id,
                        TaskStatus::Aborted,
                        Some("Cancelled before start"),
                        Utc::now(),
                    )
                    .await
                {
                    tracing::warn!(task_id = id, "Failed to persist aborted status: {e}");
                }
                tracing::info!(task_id = id, pool = %self.kind, "Task cancelled before start");
                false
            }
            Ok(Some(status)) => {
                tracing::debug!(task_id = id, %status, "Skipping task no longer queued");
                false
            }
            Ok(None) => {
                tracing::warn!(task_id = id, "Task row vanished before dispatch");
                false
            }
            Err(e) => {
                tracing::warn!(task_id = id, "Pre-flight status read failed: {e}");
                false
            }
        }
    }

    fn spawn_cancel_monitor(&self, id: i64, token: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let period = self.cancel_poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match store.get_task_status(id).await {
                        Ok(Some(TaskStatus::Cancelling)) => {
                            tracing::debug!(task_id = id, "Cancellation observed by poll");
                            token.cancel();
                            break;
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!(task_id = id, "Cancellation poll failed: {e}"),
                    },
                }
            }
        })
    }

    /// Persist the final status. The worker's write is the last one for
    /// this row, whatever a concurrent cancel wrote before it.
    async fn finish(&self, task: &mut Task, status: TaskStatus, message: Option<String>) {
        if status == TaskStatus::Aborted && task.status == TaskStatus::Started {
            let _ = task.transition_to(TaskStatus::Cancelling, None);
        }
        if let Err(e) = task.transition_to(status, message.clone()) {
            tracing::debug!(task_id = task.id, "{e}");
        }

        let ended_at = task.ended_at.unwrap_or_else(Utc::now);
        if let Err(e) = self
            .store
            .finish_task(task.id, status, message.as_deref(), ended_at)
            .await
        {
            tracing::warn!(task_id = task.id, %status, "Failed to persist final status: {e}");
            return;
        }

        let elapsed_ms = task.elapsed().map(|d| d.as_millis() as u64);
        match status {
            TaskStatus::Failed => tracing::warn!(
                task_id = task.id,
                command = %task.command_name,
                elapsed_ms,
                message = message.as_deref().unwrap_or_default(),
                "Task failed"
            ),
            _ => tracing::info!(
                task_id = task.id,
                command = %task.command_name,
                %status,
                elapsed_ms,
                "Task finished"
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use crate::tasks::handler::TaskHandler;
    use crate::tasks::model::NewTask;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl TaskHandler for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn description(&self) -> &str {
            "Reports full progress and succeeds"
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

    async fn setup(config: PoolConfig) -> (Arc<dyn TaskStore>, WorkerPool) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Arc::new(Echo)).await;
        let pool = WorkerPool::new(
            PoolKind::Default,
            config,
            store.clone(),
            handlers,
            Duration::from_millis(20),
        );
        (store, pool)
    }

    async fn wait_terminal(store: &Arc<dyn TaskStore>, id: i64) -> Task {
        for _ in 0..200 {
            let task = store.get_task(id).await.unwrap().unwrap();
            if task.status.is_terminal() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached a terminal status");
    }

    #[test]
    fn routing_is_total() {
        assert_eq!(PoolKind::for_priority(TaskPriority::High), PoolKind::HighPriority);
        assert_eq!(PoolKind::for_priority(TaskPriority::Normal), PoolKind::Default);
        assert_eq!(PoolKind::for_priority(TaskPriority::Low), PoolKind::Background);
        assert_eq!(
            PoolKind::for_priority(TaskPriority::parse_lossy("")),
            PoolKind::Default
        );
        assert_eq!(PoolKind::HighPriority.to_string(), "high-priority");
    }

    #[test]
    fn panic_payloads() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert_eq!(panic_message(&42u8), "unknown panic payload");
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let (store, pool) = setup(PoolConfig::new(1, 2)).await;
        for i in 0..2 {
            let task = store
                .insert_task(&NewTask::new(format!("t{i}"), "Echo"))
                .await
                .unwrap();
            pool.try_enqueue(task).await.unwrap();
        }
        let overflow = store.insert_task(&NewTask::new("t2", "Echo")).await.unwrap();
        assert_eq!(
            pool.try_enqueue(overflow.clone()).await,
            Err(EnqueueError::QueueFull)
        );
        assert!(!pool.is_tracking(overflow.id).await);
        assert_eq!(pool.status().await.queued_tasks, 2);
    }

    #[tokio::test]
    async fn runs_queued_tasks_after_start() {
        let (store, pool) = setup(PoolConfig::new(2, 10)).await;
        let task = store.insert_task(&NewTask::new("t", "Echo")).await.unwrap();
        pool.try_enqueue(task.clone()).await.unwrap();
        assert!(pool.is_tracking(task.id).await);

        assert!(pool.start().await);
        assert!(!pool.start().await);

        let done = wait_terminal(&store, task.id).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress.unwrap().percent, 100.0);
        assert!(done.started_at.unwrap() <= done.ended_at.unwrap());
    }

    #[tokio::test]
    async fn cancelled_while_queued_is_aborted_without_start() {
        let (store, pool) = setup(PoolConfig::new(1, 10)).await;
        let task = store.insert_task(&NewTask::new("t", "Echo")).await.unwrap();
        pool.try_enqueue(task.clone()).await.unwrap();
        assert!(store.request_task_cancel(task.id).await.unwrap());

        pool.start().await;
        let done = wait_terminal(&store, task.id).await;
        assert_eq!(done.status, TaskStatus::Aborted);
        assert!(done.started_at.is_none());
        assert!(done.ended_at.is_some());
    }

    #[tokio::test]
    async fn missing_handler_fails() {
        let (store, pool) = setup(PoolConfig::new(1, 10)).await;
        let task = store
            .insert_task(&NewTask::new("t", "NoSuchHandler"))
            .await
            .unwrap();
        pool.try_enqueue(task.clone()).await.unwrap();
        pool.start().await;

        let done = wait_terminal(&store, task.id).await;
        assert_eq!(done.status, TaskStatus::Failed);
        assert!(done.message.unwrap().contains("NoSuchHandler"));
        assert!(done.progress.is_none());
    }

    struct Blocker;

    #[async_trait]
    impl TaskHandler for Blocker {
        fn name(&self) -> &str {
            "Blocker"
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

    #[tokio::test]
    async fn shutdown_releases_waiting_tasks() {
        let (store, pool) = setup(PoolConfig::new(1, 10)).await;
        pool.inner.handlers.register(Arc::new(Blocker)).await;
        let running = store.insert_task(&NewTask::new("r", "Blocker")).await.unwrap();
        let waiting = store.insert_task(&NewTask::new("w", "Echo")).await.unwrap();
        pool.try_enqueue(running.clone()).await.unwrap();
        pool.try_enqueue(waiting.clone()).await.unwrap();
        pool.start().await;

        for _ in 0..200 {
            if pool.status().await.active_task_ids == vec![running.id] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.status().await.queued_tasks, 1);

        pool.shutdown().await;
        assert!(pool.wait_idle(Duration::from_secs(2)).await);

        let status = pool.status().await;
        assert_eq!(status.queued_tasks, 0);
        assert!(status.active_task_ids.is_empty());
        assert!(!pool.is_tracking(waiting.id).await);
        assert_eq!(
            store.get_task_status(waiting.id).await.unwrap(),
            Some(TaskStatus::Queued)
        );
        assert_eq!(
            wait_terminal(&store, running.id).await.status,
            TaskStatus::Aborted
        );
    }

    #[tokio::test]
    async fn shutdown_before_start_releases_queue() {
        let (store, pool) = setup(PoolConfig::new(1, 10)).await;
        let task = store.insert_task(&NewTask::new("t", "Echo")).await.unwrap();
        pool.try_enqueue(task.clone()).await.unwrap();

        pool.shutdown().await;
        assert!(!pool.is_tracking(task.id).await);
        assert!(!pool.start().await);
    }

    #[tokio::test]
    async fn shutdown_closes_queue() {
        let (store, pool) = setup(PoolConfig::new(1, 10)).await;
        pool.start().await;
        pool.shutdown().await;
        assert!(pool.wait_idle(Duration::from_secs(1)).await);

        let task = store.insert_task(&NewTask::new("t", "Echo")).await.unwrap();
        assert_eq!(pool.try_enqueue(task).await, Err(EnqueueError::Closed));
    }
}
