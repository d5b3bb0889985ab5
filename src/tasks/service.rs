//! Task service — the in-process facade over queueing, scheduling,
//! cancellation and pool introspection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::TaskError;
use crate::store::TaskStore;
use crate::tasks::dispatcher::Dispatcher;
use crate::tasks::handler::{HandlerInfo, HandlerRegistry, TaskHandler};
use crate::tasks::model::{
    NewScheduledTask, NewTask, ScheduledTask, ScheduledTaskPatch, Task, TaskFilter, TaskPage,
    TaskStatus, check_interval,
};
use crate::tasks::pool::{PoolKind, PoolStatus, WorkerPool};
use crate::tasks::reconciler::{self, Reconciler};
use crate::tasks::scheduler::{self, TaskScheduler};

/// One long-lived engine instance. Construct it once and share it behind
/// an `Arc`.
pub struct TaskService {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<TaskScheduler>,
    reconciler: Arc<Reconciler>,
    shutdown: CancellationToken,
    started: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskService {
    /// Build the service and its three pools. Nothing runs until
    /// [`TaskService::start`].
    pub async fn new(store: Arc<dyn TaskStore>, config: EngineConfig) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));

        for kind in PoolKind::ALL {
            let pool_config = match kind {
                PoolKind::HighPriority => config.high_priority_pool,
                PoolKind::Default => config.default_pool,
                PoolKind::Background => config.background_pool,
            };
            dispatcher
                .add_pool(Arc::new(WorkerPool::new(
                    kind,
                    pool_config,
                    store.clone(),
                    handlers.clone(),
                    config.cancel_poll_interval,
                )))
                .await;
        }

        let scheduler = Arc::new(TaskScheduler::new(store.clone(), dispatcher.clone()));
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            dispatcher.clone(),
            config.stale_queued_after,
        ));

        Self {
            config,
            store,
            handlers,
            dispatcher,
            scheduler,
            reconciler,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Handlers ────────────────────────────────────────────────────

    pub async fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.handlers.register(handler).await;
    }

    pub async fn list_handlers(&self) -> Vec<HandlerInfo> {
        self.handlers.list().await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    /// Persist a task and offer it to the pool for its priority.
    pub async fn queue_task(&self, task: NewTask) -> Result<Task, TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::ShuttingDown);
        }
        Ok(self.dispatcher.queue_task(task).await?)
    }

    pub async fn get_task(&self, id: i64) -> Result<Task, TaskError> {
        self.store
            .get_task(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, TaskError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    /// Request cancellation of a `queued` or `started` task.
    ///
    /// The row flips to `cancelling`; the owning worker resolves it to
    /// `aborted`. A queued row that no pool holds is aborted right away.
    pub async fn cancel_task(&self, id: i64) -> Result<Task, TaskError> {
        let task = self.get_task(id).await?;
        if !task.can_be_cancelled() {
            return Err(TaskError::NotCancellable {
                id,
                status: task.status,
            });
        }

        if !self.store.request_task_cancel(id).await? {
            // lost a race with the worker
            let status = self
                .store
                .get_task_status(id)
                .await?
                .ok_or(TaskError::NotFound { id })?;
            return Err(TaskError::NotCancellable { id, status });
        }

        if self.dispatcher.signal_cancel(id).await {
            tracing::info!(task_id = id, "Cancellation signalled to running task");
        } else if task.status == TaskStatus::Queued && !self.dispatcher.is_tracking(id).await {
            self.store
                .finish_task(id, TaskStatus::Aborted, Some("Cancelled before start"), Utc::now())
                .await?;
            tracing::info!(task_id = id, "Cancelled undispatched task");
        } else {
            tracing::info!(task_id = id, "Cancellation requested");
        }

        self.get_task(id).await
    }

    // ── Scheduled tasks ─────────────────────────────────────────────

    pub async fn create_scheduled_task(
        &self,
        task: NewScheduledTask,
    ) -> Result<ScheduledTask, TaskError> {
        if task.command_name.trim().is_empty() {
            return Err(TaskError::Invalid("command name must not be empty".into()));
        }
        check_interval(task.interval).map_err(TaskError::Invalid)?;

        let created = self
            .store
            .insert_scheduled_task(&task, task.first_run(Utc::now()))
            .await?;
        tracing::info!(
            scheduled_id = created.id,
            command = %created.command_name,
            interval_secs = created.interval.as_secs(),
            "Scheduled task created"
        );
        Ok(created)
    }

    pub async fn get_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, TaskError> {
        Ok(self.store.list_scheduled_tasks().await?)
    }

    pub async fn get_scheduled_task(&self, id: i64) -> Result<ScheduledTask, TaskError> {
        self.store
            .get_scheduled_task(id)
            .await?
            .ok_or(TaskError::ScheduledNotFound { id })
    }

    /// Apply a partial update. A new interval or re-enabling restarts the
    /// period from now.
    pub async fn update_scheduled_task(
        &self,
        id: i64,
        patch: ScheduledTaskPatch,
    ) -> Result<ScheduledTask, TaskError> {
        if let Some(interval) = patch.interval {
            check_interval(interval).map_err(TaskError::Invalid)?;
        }

        let mut scheduled = self.get_scheduled_task(id).await?;
        let reset = scheduled.apply(patch, Utc::now());
        self.store.update_scheduled_task(&scheduled, reset).await?;
        self.get_scheduled_task(id).await
    }

    pub async fn delete_scheduled_task(&self, id: i64) -> Result<(), TaskError> {
        if self.store.delete_scheduled_task(id).await? {
            tracing::info!(scheduled_id = id, "Scheduled task deleted");
            Ok(())
        } else {
            Err(TaskError::ScheduledNotFound { id })
        }
    }

    /// Create the definition unless one already exists for its command.
    pub async fn ensure_scheduled_task(
        &self,
        task: NewScheduledTask,
    ) -> Result<ScheduledTask, TaskError> {
        match self
            .store
            .find_scheduled_task_by_command(&task.command_name)
            .await?
        {
            Some(existing) => Ok(existing),
            None => self.create_scheduled_task(task).await,
        }
    }

    // ── Introspection ───────────────────────────────────────────────

    pub async fn get_queue_status(&self) -> BTreeMap<String, PoolStatus> {
        self.dispatcher.queue_status().await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Recover rows from a previous run, start the pools, and spawn the
    /// scheduler and reconciler loops. Calling it twice is a no-op.
    pub async fn start(&self) -> Result<(), TaskError> {
        if self.shutdown.is_cancelled() {
            return Err(TaskError::ShuttingDown);
        }
        self.config
            .clone()
            .validated()
            .map_err(|e| TaskError::Invalid(e.to_string()))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.reconciler.recover_interrupted().await?;

        for pool in self.dispatcher.pools().await {
            pool.start().await;
        }

        let mut loops = self.loops.lock().await;
        loops.push(scheduler::spawn_ticker(
            self.scheduler.clone(),
            self.config.scheduler_interval,
            self.shutdown.clone(),
        ));
        loops.push(reconciler::spawn_loop(
            self.reconciler.clone(),
            self.config.reconcile_interval,
            self.shutdown.clone(),
        ));

        tracing::info!(
            handlers = self.handlers.count().await,
            "Task service started"
        );
        Ok(())
    }

    /// Stop the loops, cancel in-flight tasks and wait up to the configured
    /// grace period for them to finish.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("Task service shutting down");
        self.shutdown.cancel();

        let pools = self.dispatcher.pools().await;
        for pool in &pools {
            pool.shutdown().await;
        }
        for pool in &pools {
            if !pool.wait_idle(self.config.shutdown_grace).await {
                tracing::warn!(
                    pool = %pool.kind(),
                    "Grace period elapsed with tasks still running"
                );
            }
        }

        for handle in self.loops.lock().await.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("Background loop ended abnormally: {e}");
            }
        }
        tracing::info!("Task service stopped");
    }
}
