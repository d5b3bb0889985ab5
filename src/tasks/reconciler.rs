//! Reconciler — re-offers `queued` rows that never reached a pool, and
//! cleans up rows a previous process left mid-flight.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::dispatcher::Dispatcher;
use crate::tasks::model::TaskStatus;

/// Counts from a startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed: usize,
    pub aborted: usize,
    pub requeued: usize,
}

pub struct Reconciler {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    stale_after: Duration,
}

impl Reconciler {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<Dispatcher>, stale_after: Duration) -> Self {
        Self {
            store,
            dispatcher,
            stale_after,
        }
    }

    /// Re-offer `queued` rows older than `stale_after` that no pool holds.
    /// Returns how many were accepted by a pool.
    pub async fn reconcile(&self) -> Result<usize, DatabaseError> {
        let stale = chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - stale;

        let mut requeued = 0;
        for task in self.store.list_queued_before(cutoff).await? {
            let task_id = task.id;
            if self.dispatcher.redispatch(task).await {
                requeued += 1;
                tracing::debug!(task_id, "Re-dispatched stale queued task");
            }
        }
        if requeued > 0 {
            tracing::info!(requeued, "Reconciled stale queued tasks");
        }
        Ok(requeued)
    }

    /// Resolve rows left behind by a previous process, then re-offer every
    /// `queued` row. Run once before the pools start.
    pub async fn recover_interrupted(&self) -> Result<RecoveryReport, DatabaseError> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for task in self.store.list_tasks_by_status(TaskStatus::Started).await? {
            if self.dispatcher.is_tracking(task.id).await {
                continue;
            }
            self.store
                .finish_task(task.id, TaskStatus::Failed, Some("Interrupted by restart"), now)
                .await?;
            report.failed += 1;
        }

        for task in self.store.list_tasks_by_status(TaskStatus::Cancelling).await? {
            if self.dispatcher.is_tracking(task.id).await {
                continue;
            }
            self.store
                .finish_task(task.id, TaskStatus::Aborted, Some("Cancelled before restart"), now)
                .await?;
            report.aborted += 1;
        }

        for task in self.store.list_tasks_by_status(TaskStatus::Queued).await? {
            if self.dispatcher.redispatch(task).await {
                report.requeued += 1;
            }
        }

        tracing::info!(
            failed = report.failed,
            aborted = report.aborted,
            requeued = report.requeued,
            "Recovered tasks from previous run"
        );
        Ok(report)
    }
}

/// Spawn the periodic reconcile loop. Stops when `shutdown` fires.
pub fn spawn_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = reconciler.reconcile().await {
                        tracing::warn!("Reconcile pass failed: {e}");
                    }
                }
            }
        }
        tracing::debug!("Reconciler stopped");
    })
}
