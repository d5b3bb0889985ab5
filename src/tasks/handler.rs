//! Task handler trait, execution context, and the handler registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::store::TaskStore;
use crate::tasks::model::{Task, TaskProgress};

/// A unit of work bound to a command name.
///
/// Handlers are shared across workers and may run concurrently for
/// different tasks, so implementations must be `Send + Sync`.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Command name this handler is registered under.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Run the task. Long-running handlers should call
    /// [`TaskContext::checkpoint`] between steps and return
    /// `HandlerError::Cancelled` once cancellation is observed.
    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError>;
}

/// Per-execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: i64,
    token: CancellationToken,
}

impl TaskContext {
    pub fn new(task_id: i64, token: CancellationToken) -> Self {
        Self { task_id, token }
    }

    /// Whether cancellation has been requested for this task.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested. Useful inside `select!`.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Return `Err(Cancelled)` if cancellation has been requested.
    pub fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            Err(HandlerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Writes advisory progress for one task.
#[derive(Clone)]
pub struct ProgressReporter {
    task_id: i64,
    store: Arc<dyn TaskStore>,
}

impl ProgressReporter {
    pub fn new(task_id: i64, store: Arc<dyn TaskStore>) -> Self {
        Self { task_id, store }
    }

    /// Persist progress. Failures are logged; progress never fails a task.
    pub async fn update(&self, percent: f64, message: Option<String>) {
        let progress = TaskProgress::new(percent, message);
        if let Err(e) = self.store.update_task_progress(self.task_id, &progress).await {
            tracing::warn!(task_id = self.task_id, "Failed to record progress: {e}");
        }
    }
}

/// Name and description of a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub name: String,
    pub description: String,
}

/// Registry of task handlers keyed by command name.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler. A later registration for the same name replaces
    /// the earlier one.
    pub async fn register(&self, handler: Arc<dyn TaskHandler>) {
        let name = handler.name().to_string();
        if self
            .handlers
            .write()
            .await
            .insert(name.clone(), handler)
            .is_some()
        {
            tracing::warn!(command = %name, "Replaced existing task handler");
        } else {
            tracing::debug!("Registered task handler: {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    /// All registered handlers, sorted by name.
    pub async fn list(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .handlers
            .read()
            .await
            .values()
            .map(|h| HandlerInfo {
                name: h.name().to_string(),
                description: h.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
