//! Health checks — runs each registered probe and fails if any does.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::store::TaskStore;
use crate::tasks::{ProgressReporter, Task, TaskContext, TaskHandler};

pub const COMMAND: &str = "HealthCheck";

/// One health probe.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> anyhow::Result<()>;
}

/// Round trip to the task database.
pub struct DatabaseHealthCheck {
    store: Arc<dyn TaskStore>,
}

impl DatabaseHealthCheck {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for DatabaseHealthCheck {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> anyhow::Result<()> {
        self.store.ping().await?;
        Ok(())
    }
}

pub struct HealthCheckHandler {
    checks: Vec<Arc<dyn HealthCheck>>,
}

impl HealthCheckHandler {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        Self { checks }
    }
}

#[async_trait]
impl TaskHandler for HealthCheckHandler {
    fn name(&self) -> &str {
        COMMAND
    }

    fn description(&self) -> &str {
        "Run the server's health checks"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let total = self.checks.len().max(1);
        let mut failures = Vec::new();

        for (i, check) in self.checks.iter().enumerate() {
            ctx.checkpoint()?;
            match check.check().await {
                Ok(()) => tracing::debug!(check = check.name(), "Health check passed"),
                Err(e) => {
                    tracing::warn!(check = check.name(), "Health check failed: {e:#}");
                    failures.push(format!("{}: {e:#}", check.name()));
                }
            }
            progress
                .update(
                    (i + 1) as f64 * 100.0 / total as f64,
                    Some(format!("Checked {}", check.name())),
                )
                .await;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(HandlerError::Failed(format!(
                "{} of {} health checks failed: {}",
                failures.len(),
                self.checks.len(),
                failures.join("; ")
            )))
        }
    }
}
