//! Import list sync — pulls new movies from one list or every enabled list.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::HandlerError;
use crate::handlers::for_each_id;
use crate::tasks::{ProgressReporter, Task, TaskContext, TaskHandler};

pub const COMMAND: &str = "ImportListSync";

#[async_trait]
pub trait ImportListSource: Send + Sync {
    async fn enabled_list_ids(&self) -> anyhow::Result<Vec<i64>>;
    /// Sync one list; returns how many movies were added.
    async fn sync_list(&self, list_id: i64) -> anyhow::Result<usize>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncBody {
    list_id: Option<i64>,
}

pub struct ImportListSyncHandler {
    source: Arc<dyn ImportListSource>,
}

impl ImportListSyncHandler {
    pub fn new(source: Arc<dyn ImportListSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl TaskHandler for ImportListSyncHandler {
    fn name(&self) -> &str {
        COMMAND
    }

    fn description(&self) -> &str {
        "Sync import lists and add newly listed movies"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let body: SyncBody = task.body_as()?;
        let ids = match body.list_id {
            Some(id) => vec![id],
            None => self.source.enabled_list_ids().await?,
        };

        let source = &self.source;
        let task_id = ctx.task_id;
        for_each_id(ctx, progress, "list", &ids, |list_id| async move {
            let added = source.sync_list(list_id).await?;
            tracing::debug!(task_id, list_id, added, "Import list synced");
            Ok::<(), anyhow::Error>(())
        })
        .await
    }
}
