//! `TaskStore` trait — the engine's single async persistence interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::tasks::model::{
    NewScheduledTask, NewTask, ScheduledTask, Task, TaskFilter, TaskPage, TaskProgress, TaskStatus,
};

/// Backend-agnostic storage for task and scheduled-task rows.
///
/// Every mutation is a single-row statement; there are no cross-row
/// transactions, so concurrent writers resolve last-writer-wins.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new `queued` row and return it with its assigned id.
    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Read only the status column.
    async fn get_task_status(&self, id: i64) -> Result<Option<TaskStatus>, DatabaseError>;

    /// Page through tasks, newest queued first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, DatabaseError>;

    /// All tasks currently in `status`, oldest first.
    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError>;

    /// `queued` rows queued before `cutoff`, oldest first.
    async fn list_queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError>;

    /// Set `started` + `started_at`, only if the row is still `queued`.
    /// Returns whether the row was updated.
    async fn mark_task_started(&self, id: i64, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Write a terminal status with `ended_at`. Unconditional.
    async fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Flip to `cancelling` if the row is `queued` or `started`.
    /// Returns whether the row was updated.
    async fn request_task_cancel(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn update_task_progress(
        &self,
        id: i64,
        progress: &TaskProgress,
    ) -> Result<(), DatabaseError>;

    /// Delete terminal rows that ended before `cutoff`. Returns rows deleted.
    async fn delete_finished_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    // ── Scheduled tasks ─────────────────────────────────────────────

    async fn insert_scheduled_task(
        &self,
        task: &NewScheduledTask,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduledTask, DatabaseError>;

    async fn get_scheduled_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError>;

    async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError>;

    /// Enabled definitions with `next_run <= now`.
    async fn list_due_scheduled_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTask>, DatabaseError>;

    async fn find_scheduled_task_by_command(
        &self,
        command_name: &str,
    ) -> Result<Option<ScheduledTask>, DatabaseError>;

    /// Persist the editable columns of an existing definition. `next_run`
    /// is only written when `reset_next_run` is set, so an edit never
    /// rolls back a concurrent scheduler advance.
    async fn update_scheduled_task(
        &self,
        task: &ScheduledTask,
        reset_next_run: bool,
    ) -> Result<(), DatabaseError>;

    async fn record_scheduled_run(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn delete_scheduled_task(&self, id: i64) -> Result<bool, DatabaseError>;
}
