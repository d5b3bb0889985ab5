//! Scheduler — turns due recurring definitions into queued tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::dispatcher::Dispatcher;
use crate::tasks::model::{NewTask, ScheduledTask, Task};

/// Periodically scans scheduled tasks and queues the due ones.
///
/// The scheduler never runs handler logic; it only produces task rows that
/// take the normal dispatch path.
pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Queue every due definition. Returns how many were queued.
    pub async fn tick(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let due = self.store.list_due_scheduled_tasks(now).await?;

        let mut queued = 0;
        for scheduled in &due {
            match self.run_once(scheduled, now).await {
                Ok(task) => {
                    queued += 1;
                    tracing::debug!(
                        scheduled_id = scheduled.id,
                        task_id = task.id,
                        command = %scheduled.command_name,
                        "Scheduled task dispatched"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        scheduled_id = scheduled.id,
                        command = %scheduled.command_name,
                        "Failed to dispatch scheduled task: {e}"
                    );
                }
            }
        }
        Ok(queued)
    }

    async fn run_once(
        &self,
        scheduled: &ScheduledTask,
        now: DateTime<Utc>,
    ) -> Result<Task, DatabaseError> {
        let task = self
            .dispatcher
            .queue_task(NewTask::from_scheduled(scheduled))
            .await?;
        self.store
            .record_scheduled_run(scheduled.id, scheduled.next_run, scheduled.next_run_after(now))
            .await?;
        Ok(task)
    }
}

/// Spawn the periodic tick loop. Stops when `shutdown` fires.
pub fn spawn_ticker(
    scheduler: Arc<TaskScheduler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = scheduler.tick().await {
                        tracing::warn!("Scheduler tick failed: {e}");
                    }
                }
            }
        }
        tracing::debug!("Scheduler stopped");
    })
}
