//! Built-in task handlers.
//!
//! Each handler decodes its own body and reaches the rest of the server
//! only through a narrow collaborator trait.

pub mod cleanup;
pub mod health;
pub mod import_list;
pub mod metadata;
pub mod search;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::HandlerError;
use crate::tasks::model::{NewScheduledTask, TaskPriority};
use crate::tasks::{ProgressReporter, TaskContext, TaskService};

pub use cleanup::CleanupHandler;
pub use health::{DatabaseHealthCheck, HealthCheck, HealthCheckHandler};
pub use import_list::{ImportListSource, ImportListSyncHandler};
pub use metadata::{MetadataSource, RefreshMetadataHandler};
pub use search::{AutomaticSearchHandler, MovieSearcher, WantedMoviesHandler};

const HOUR: u64 = 60 * 60;

/// Services the built-in handlers delegate to. Handlers whose collaborator
/// is absent are not registered.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub metadata: Option<Arc<dyn MetadataSource>>,
    pub import_lists: Option<Arc<dyn ImportListSource>>,
    pub searcher: Option<Arc<dyn MovieSearcher>>,
    /// Checks run in addition to the database round trip.
    pub health_checks: Vec<Arc<dyn HealthCheck>>,
}

/// Register every built-in handler that can run with `collaborators`.
pub async fn register_builtin_handlers(service: &TaskService, collaborators: &Collaborators) {
    let store = service.store();

    service
        .register_handler(Arc::new(CleanupHandler::new(store.clone())))
        .await;

    let mut checks: Vec<Arc<dyn HealthCheck>> = vec![Arc::new(DatabaseHealthCheck::new(store))];
    checks.extend(collaborators.health_checks.iter().cloned());
    service
        .register_handler(Arc::new(HealthCheckHandler::new(checks)))
        .await;

    if let Some(source) = &collaborators.metadata {
        service
            .register_handler(Arc::new(RefreshMetadataHandler::new(source.clone())))
            .await;
    }
    if let Some(source) = &collaborators.import_lists {
        service
            .register_handler(Arc::new(ImportListSyncHandler::new(source.clone())))
            .await;
    }
    if let Some(searcher) = &collaborators.searcher {
        service
            .register_handler(Arc::new(WantedMoviesHandler::new(searcher.clone())))
            .await;
        service
            .register_handler(Arc::new(AutomaticSearchHandler::new(searcher.clone())))
            .await;
    }
}

/// Recurring definitions seeded at startup.
pub fn default_schedules(collaborators: &Collaborators) -> Vec<NewScheduledTask> {
    let mut schedules = vec![
        NewScheduledTask::new(
            "Health Check",
            health::COMMAND,
            Duration::from_secs(6 * HOUR),
        )
        .with_priority(TaskPriority::Low),
        NewScheduledTask::new(
            "Housekeeping",
            cleanup::COMMAND,
            Duration::from_secs(24 * HOUR),
        )
        .with_priority(TaskPriority::Low),
    ];
    if collaborators.searcher.is_some() {
        schedules.push(NewScheduledTask::new(
            "Refresh Wanted Movies",
            search::WANTED_COMMAND,
            Duration::from_secs(12 * HOUR),
        ));
    }
    schedules
}

/// Run `f` for each id, checking for cancellation before every unit and
/// reporting progress after it. Unit failures are collected rather than
/// stopping the batch; any failure fails the task at the end.
pub(crate) async fn for_each_id<F, Fut>(
    ctx: &TaskContext,
    progress: &ProgressReporter,
    noun: &str,
    ids: &[i64],
    mut f: F,
) -> Result<(), HandlerError>
where
    F: FnMut(i64) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let total = ids.len();
    if total == 0 {
        progress
            .update(100.0, Some(format!("No {noun}s to process")))
            .await;
        return Ok(());
    }

    let mut failures = Vec::new();
    for (i, &id) in ids.iter().enumerate() {
        ctx.checkpoint()?;
        if let Err(e) = f(id).await {
            tracing::warn!(task_id = ctx.task_id, "{noun} {id} failed: {e:#}");
            failures.push(format!("{noun} {id}: {e:#}"));
        }
        let done = i + 1;
        progress
            .update(
                done as f64 * 100.0 / total as f64,
                Some(format!("{done}/{total} {noun}s")),
            )
            .await;
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(HandlerError::Failed(format!(
            "{} of {total} {noun}s failed: {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::{LibSqlBackend, TaskStore};
    use testing::harness;

    #[tokio::test]
    async fn batch_collects_failures_and_reports_progress() {
        let h = harness("Batch", serde_json::json!({})).await;
        let err = for_each_id(&h.ctx, &h.progress, "movie", &[1, 2, 3], |id| async move {
            if id == 2 {
                return Err(anyhow::anyhow!("not found"));
            }
            Ok::<(), anyhow::Error>(())
        })
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.starts_with("1 of 3 movies failed"), "{message}");
        assert!(message.contains("movie 2: not found"));
        assert_eq!(h.progress_percent().await, Some(100.0));
    }

    #[tokio::test]
    async fn batch_stops_on_cancellation() {
        let h = harness("Batch", serde_json::json!({})).await;
        let token = h.token.clone();
        let mut seen = Vec::new();
        let err = for_each_id(&h.ctx, &h.progress, "movie", &[1, 2, 3], |id| {
            seen.push(id);
            token.cancel();
            async { Ok::<(), anyhow::Error>(()) }
        })
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(seen, vec![1]);
    }

    #[tokio::test]
    async fn registration_depends_on_collaborators() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let service = TaskService::new(store, EngineConfig::default()).await;
        let collaborators = Collaborators::default();
        register_builtin_handlers(&service, &collaborators).await;

        let names: Vec<String> = service
            .list_handlers()
            .await
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, vec!["Cleanup", "HealthCheck"]);

        let schedules = default_schedules(&collaborators);
        assert_eq!(schedules.len(), 2);
        assert!(schedules.iter().all(|s| !s.interval.is_zero()));
    }
}
