//! Housekeeping — prunes finished task rows past their retention window.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use crate::error::HandlerError;
use crate::store::TaskStore;
use crate::tasks::{ProgressReporter, Task, TaskContext, TaskHandler};

pub const COMMAND: &str = "Cleanup";

/// Days a finished task is kept when the body does not say otherwise.
const DEFAULT_RETENTION_DAYS: u32 = 7;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupBody {
    retention_days: Option<u32>,
}

pub struct CleanupHandler {
    store: Arc<dyn TaskStore>,
}

impl CleanupHandler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for CleanupHandler {
    fn name(&self) -> &str {
        COMMAND
    }

    fn description(&self) -> &str {
        "Delete completed, failed and aborted tasks older than the retention window"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let body: CleanupBody = task.body_as()?;
        let days = body.retention_days.unwrap_or(DEFAULT_RETENTION_DAYS);
        ctx.checkpoint()?;

        let cutoff = chrono::Duration::try_days(i64::from(days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .ok_or_else(|| {
                HandlerError::InvalidBody(format!("retentionDays {days} is out of range"))
            })?;
        let deleted = self.store.delete_finished_tasks_before(cutoff).await?;

        tracing::info!(task_id = ctx.task_id, deleted, retention_days = days, "Pruned finished tasks");
        progress
            .update(100.0, Some(format!("Removed {deleted} finished tasks")))
            .await;
        Ok(())
    }
}
