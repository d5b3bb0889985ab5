//! Task data model and lifecycle state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::HandlerError;

/// Opaque key/value payload interpreted only by the handler.
pub type TaskBody = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Persisted and waiting for a worker.
    Queued,
    /// A worker is executing the handler.
    Started,
    /// Cancellation requested; resolved to `Aborted` by the worker.
    Cancelling,
    Completed,
    Failed,
    Aborted,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Queued, Started)
                | (Queued, Cancelling)
                | (Started, Cancelling)
                | (Started, Completed)
                | (Started, Failed)
                | (Cancelling, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Cancellation may only be requested before or during execution.
    pub fn can_be_cancelled(&self) -> bool {
        matches!(self, Self::Queued | Self::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Priority class; decides which pool runs the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    #[default]
    Normal,
    Low,
}

impl TaskPriority {
    /// Total parse: anything that is not `high` or `low` is `normal`.
    pub fn parse_lossy(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskTrigger {
    #[default]
    Manual,
    Scheduled,
}

impl TaskTrigger {
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "scheduled" => Self::Scheduled,
            _ => Self::Manual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TaskTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory progress reported by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent: f64,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(percent: f64, message: Option<String>) -> Self {
        let percent = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        Self { percent, message }
    }
}

/// One persisted unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub priority: TaskPriority,
    pub trigger: TaskTrigger,
    pub status: TaskStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Failure detail or last status note.
    pub message: Option<String>,
    pub progress: Option<TaskProgress>,
}

impl Task {
    pub fn can_be_cancelled(&self) -> bool {
        self.status.can_be_cancelled()
    }

    /// Transition to a new status, maintaining the lifecycle timestamps.
    pub fn transition_to(
        &mut self,
        new_status: TaskStatus,
        message: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition task {} from {} to {}",
                self.id, self.status, new_status
            ));
        }

        let now = Utc::now();
        match new_status {
            TaskStatus::Started if self.started_at.is_none() => self.started_at = Some(now),
            s if s.is_terminal() => self.ended_at = Some(now),
            _ => {}
        }
        if message.is_some() {
            self.message = message;
        }
        self.status = new_status;
        self.updated_at = now;
        Ok(())
    }

    /// Decode the body into the handler's typed view.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(serde_json::Value::Object(self.body.clone())).map_err(|e| {
            HandlerError::InvalidBody(format!("{} ({}): {e}", self.command_name, self.name))
        })
    }

    /// Time from dispatch to the terminal transition.
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        let end = self.ended_at.unwrap_or_else(Utc::now);
        end.signed_duration_since(start).to_std().ok()
    }
}

/// Insert request for a new task row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub priority: TaskPriority,
    pub trigger: TaskTrigger,
}

impl NewTask {
    pub fn new(name: impl Into<String>, command_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_name: command_name.into(),
            body: TaskBody::new(),
            priority: TaskPriority::Normal,
            trigger: TaskTrigger::Manual,
        }
    }

    pub fn with_body(mut self, body: TaskBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_trigger(mut self, trigger: TaskTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// The task a scheduled definition produces on each run.
    pub fn from_scheduled(scheduled: &ScheduledTask) -> Self {
        Self {
            name: scheduled.name.clone(),
            command_name: scheduled.command_name.clone(),
            body: scheduled.body.clone(),
            priority: scheduled.priority,
            trigger: TaskTrigger::Scheduled,
        }
    }
}

/// A recurring task template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub priority: TaskPriority,
    pub interval: Duration,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run <= now
    }

    /// `next_run` for a dispatch happening at `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        advance(now, self.interval)
    }

    /// Apply a patch; a new interval or re-enabling restarts the period from `now`.
    /// Returns whether `next_run` was reset.
    #[must_use]
    pub fn apply(&mut self, patch: ScheduledTaskPatch, now: DateTime<Utc>) -> bool {
        let mut reset = false;
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(body) = patch.body {
            self.body = body;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(interval) = patch.interval
            && interval != self.interval
        {
            self.interval = interval;
            reset = true;
        }
        if let Some(enabled) = patch.enabled {
            reset |= enabled && !self.enabled;
            self.enabled = enabled;
        }
        if reset {
            self.next_run = advance(now, self.interval);
        }
        self.updated_at = now;
        reset
    }
}

/// Create request for a scheduled task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScheduledTask {
    pub name: String,
    pub command_name: String,
    pub body: TaskBody,
    pub priority: TaskPriority,
    pub interval: Duration,
    pub enabled: bool,
}

impl NewScheduledTask {
    pub fn new(
        name: impl Into<String>,
        command_name: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            command_name: command_name.into(),
            body: TaskBody::new(),
            priority: TaskPriority::Normal,
            interval,
            enabled: true,
        }
    }

    pub fn with_body(mut self, body: TaskBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Initial `next_run` for a definition created at `now`.
    pub fn first_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        advance(now, self.interval)
    }
}

/// Partial update for a scheduled task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScheduledTaskPatch {
    pub name: Option<String>,
    pub body: Option<TaskBody>,
    pub priority: Option<TaskPriority>,
    pub interval: Option<Duration>,
    pub enabled: Option<bool>,
}

/// Query for `list_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub command_name: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            command_name: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of tasks plus the total matching the filter.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: u64,
}

/// Longest accepted recurrence interval.
pub const MAX_SCHEDULE_INTERVAL: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Reject intervals the scheduler cannot run: zero, or longer than
/// [`MAX_SCHEDULE_INTERVAL`].
pub fn check_interval(interval: Duration) -> Result<(), String> {
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    if interval > MAX_SCHEDULE_INTERVAL {
        return Err(format!(
            "interval must not exceed {} days",
            MAX_SCHEDULE_INTERVAL.as_secs() / 86_400
        ));
    }
    Ok(())
}

fn advance(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = chrono::Duration::from_std(interval.min(MAX_SCHEDULE_INTERVAL))
        .unwrap_or(chrono::Duration::zero());
    now.checked_add_signed(step).unwrap_or(now)
}
