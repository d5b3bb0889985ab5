//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{
    NewScheduledTask, NewTask, ScheduledTask, Task, TaskBody, TaskFilter, TaskPage, TaskPriority,
    TaskProgress, TaskStatus, TaskTrigger,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }

    async fn query_scheduled(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_scheduled(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => tracing::warn!("Skipping scheduled task row: {e}"),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

const TASK_COLUMNS: &str = "id, name, command_name, body, priority, status, trigger_type, queued_at, started_at, ended_at, updated_at, message, progress_percent, progress_message";

const SCHEDULED_COLUMNS: &str = "id, name, command_name, body, interval_ms, priority, enabled, last_run, next_run, created_at, updated_at";

/// Fixed-precision RFC 3339 so stored timestamps sort lexicographically.
fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("invalid timestamp '{s}'")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn interval_to_ms(interval: Duration) -> Result<i64, DatabaseError> {
    i64::try_from(interval.as_millis())
        .map_err(|_| DatabaseError::Serialization(format!("interval {interval:?} out of range")))
}

fn optional_text(value: Option<String>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn body_to_json(body: &TaskBody) -> Result<String, DatabaseError> {
    serde_json::to_string(body).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn body_from_json(s: &str) -> Result<TaskBody, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("task body: {e}")))
}

/// Map a libsql Row to a Task.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let status_str: String = row.get(5)?;
    let status = status_str
        .parse::<TaskStatus>()
        .map_err(DatabaseError::Serialization)?;
    let body_str: String = row.get(3).unwrap_or_else(|_| "{}".to_string());

    let progress = row.get::<f64>(12).ok().map(|percent| TaskProgress {
        percent,
        message: row.get::<String>(13).ok(),
    });

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        command_name: row.get(2)?,
        body: body_from_json(&body_str)?,
        priority: TaskPriority::parse_lossy(&row.get::<String>(4).unwrap_or_default()),
        trigger: TaskTrigger::parse_lossy(&row.get::<String>(6).unwrap_or_default()),
        status,
        queued_at: parse_datetime(&row.get::<String>(7)?)?,
        started_at: parse_optional_datetime(row.get::<String>(8).ok())?,
        ended_at: parse_optional_datetime(row.get::<String>(9).ok())?,
        updated_at: parse_datetime(&row.get::<String>(10)?)?,
        message: row.get::<String>(11).ok(),
        progress,
    })
}

/// Map a libsql Row to a ScheduledTask.
///
/// Column order matches SCHEDULED_COLUMNS.
fn row_to_scheduled(row: &libsql::Row) -> Result<ScheduledTask, DatabaseError> {
    let body_str: String = row.get(3).unwrap_or_else(|_| "{}".to_string());
    let interval_ms: i64 = row.get(4)?;

    Ok(ScheduledTask {
        id: row.get(0)?,
        name: row.get(1)?,
        command_name: row.get(2)?,
        body: body_from_json(&body_str)?,
        interval: Duration::from_millis(interval_ms.max(0) as u64),
        priority: TaskPriority::parse_lossy(&row.get::<String>(5).unwrap_or_default()),
        enabled: row.get::<i64>(6).unwrap_or(0) != 0,
        last_run: parse_optional_datetime(row.get::<String>(7).ok())?,
        next_run: parse_datetime(&row.get::<String>(8)?)?,
        created_at: parse_datetime(&row.get::<String>(9)?)?,
        updated_at: parse_datetime(&row.get::<String>(10)?)?,
    })
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT 1", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Query(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let body = body_to_json(&task.body)?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO tasks (name, command_name, body, priority, status, trigger_type, queued_at, updated_at) VALUES (?1, ?2, ?3, ?4, 'queued', ?5, ?6, ?7) RETURNING {TASK_COLUMNS}"
                ),
                params![
                    task.name.clone(),
                    task.command_name.clone(),
                    body,
                    task.priority.as_str(),
                    task.trigger.as_str(),
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row),
            Ok(None) => Err(DatabaseError::Query(
                "insert_task: no row returned".to_string(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("insert_task: {e}"))),
        }
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn get_task_status(&self, id: i64) -> Result<Option<TaskStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let status: String = row.get(0)?;
                Ok(Some(
                    status.parse().map_err(DatabaseError::Serialization)?,
                ))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task_status: {e}"))),
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<TaskPage, DatabaseError> {
        let status = optional_text(filter.status.map(|s| s.as_str().to_string()));
        let command = optional_text(filter.command_name.clone());
        let where_clause =
            "WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR command_name = ?2)";

        let mut rows = self
            .conn()
            .query(
                &format!("SELECT COUNT(*) FROM tasks {where_clause}"),
                params![status.clone(), command.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks count: {e}")))?;
        let total: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0)?,
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("list_tasks count: {e}"))),
        };

        let tasks = self
            .query_tasks(
                "list_tasks",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks {where_clause} ORDER BY queued_at DESC, id DESC LIMIT ?3 OFFSET ?4"
                ),
                params![status, command, filter.limit as i64, filter.offset as i64],
            )
            .await?;

        Ok(TaskPage {
            tasks,
            total: total.max(0) as u64,
        })
    }

    async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_tasks_by_status",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY queued_at, id"),
            params![status.as_str()],
        )
        .await
    }

    async fn list_queued_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            "list_queued_before",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'queued' AND queued_at <= ?1 ORDER BY queued_at, id"
            ),
            params![fmt_datetime(cutoff)],
        )
        .await
    }

    async fn mark_task_started(&self, id: i64, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let at = fmt_datetime(at);
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'started', started_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![at, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_task_started: {e}")))?;
        Ok(count > 0)
    }

    async fn finish_task(
        &self,
        id: i64,
        status: TaskStatus,
        message: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let at = fmt_datetime(at);
        self.conn()
            .execute(
                "UPDATE tasks SET status = ?1, ended_at = ?2, updated_at = ?2, message = COALESCE(?3, message) WHERE id = ?4",
                params![
                    status.as_str(),
                    at,
                    optional_text(message.map(str::to_string)),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_task: {e}")))?;
        Ok(())
    }

    async fn request_task_cancel(&self, id: i64) -> Result<bool, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelling', updated_at = ?1 WHERE id = ?2 AND status IN ('queued', 'started')",
                params![now, id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("request_task_cancel: {e}")))?;
        Ok(count > 0)
    }

    async fn update_task_progress(
        &self,
        id: i64,
        progress: &TaskProgress,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET progress_percent = ?1, progress_message = ?2 WHERE id = ?3",
                params![progress.percent, optional_text(progress.message.clone()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_progress: {e}")))?;
        Ok(())
    }

    async fn delete_finished_tasks_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE status IN ('completed', 'failed', 'aborted') AND ended_at IS NOT NULL AND ended_at < ?1",
                params![fmt_datetime(cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_finished_tasks_before: {e}")))?;
        Ok(count)
    }

    // ── Scheduled tasks ─────────────────────────────────────────────

    async fn insert_scheduled_task(
        &self,
        task: &NewScheduledTask,
        next_run: DateTime<Utc>,
    ) -> Result<ScheduledTask, DatabaseError> {
        let now = fmt_datetime(Utc::now());
        let body = body_to_json(&task.body)?;

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO scheduled_tasks (name, command_name, body, interval_ms, priority, enabled, next_run, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) RETURNING {SCHEDULED_COLUMNS}"
                ),
                params![
                    task.name.clone(),
                    task.command_name.clone(),
                    body,
                    interval_to_ms(task.interval)?,
                    task.priority.as_str(),
                    task.enabled as i64,
                    fmt_datetime(next_run),
                    now.clone(),
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_scheduled_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_scheduled(&row),
            Ok(None) => Err(DatabaseError::Query(
                "insert_scheduled_task: no row returned".to_string(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("insert_scheduled_task: {e}"))),
        }
    }

    async fn get_scheduled_task(&self, id: i64) -> Result<Option<ScheduledTask>, DatabaseError> {
        let tasks = self
            .query_scheduled(
                "get_scheduled_task",
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn list_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>, DatabaseError> {
        self.query_scheduled(
            "list_scheduled_tasks",
            &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_tasks ORDER BY name, id"),
            (),
        )
        .await
    }

    async fn list_due_scheduled_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScheduledTask>, DatabaseError> {
        self.query_scheduled(
            "list_due_scheduled_tasks",
            &format!(
                "SELECT {SCHEDULED_COLUMNS} FROM scheduled_tasks WHERE enabled = 1 AND next_run <= ?1 ORDER BY next_run, id"
            ),
            params![fmt_datetime(now)],
        )
        .await
    }

    async fn find_scheduled_task_by_command(
        &self,
        command_name: &str,
    ) -> Result<Option<ScheduledTask>, DatabaseError> {
        let tasks = self
            .query_scheduled(
                "find_scheduled_task_by_command",
                &format!(
                    "SELECT {SCHEDULED_COLUMNS} FROM scheduled_tasks WHERE command_name = ?1 ORDER BY id LIMIT 1"
                ),
                params![command_name],
            )
            .await?;
        Ok(tasks.into_iter().next())
    }

    async fn update_scheduled_task(
        &self,
        task: &ScheduledTask,
        reset_next_run: bool,
    ) -> Result<(), DatabaseError> {
        let body = body_to_json(&task.body)?;
        let next_run = reset_next_run.then(|| fmt_datetime(task.next_run));
        self.conn()
            .execute(
                "UPDATE scheduled_tasks SET name = ?1, body = ?2, interval_ms = ?3, priority = ?4, enabled = ?5, next_run = COALESCE(?6, next_run), updated_at = ?7 WHERE id = ?8",
                params![
                    task.name.clone(),
                    body,
                    interval_to_ms(task.interval)?,
                    task.priority.as_str(),
                    task.enabled as i64,
                    optional_text(next_run),
                    fmt_datetime(task.updated_at),
                    task.id,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_scheduled_task: {e}")))?;
        Ok(())
    }

    async fn record_scheduled_run(
        &self,
        id: i64,
        last_run: DateTime<Utc>,
        next_run: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE scheduled_tasks SET last_run = ?1, next_run = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    fmt_datetime(last_run),
                    fmt_datetime(next_run),
                    fmt_datetime(Utc::now()),
                    id
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_scheduled_run: {e}")))?;
        Ok(())
    }

    async fn delete_scheduled_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_scheduled_task: {e}")))?;
        Ok(count > 0)
    }
}
