//! Metadata refresh for one movie or every monitored movie.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::HandlerError;
use crate::handlers::for_each_id;
use crate::tasks::{ProgressReporter, Task, TaskContext, TaskHandler};

pub const COMMAND: &str = "RefreshMetadata";

/// Metadata provider the refresh delegates to.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn monitored_movie_ids(&self) -> anyhow::Result<Vec<i64>>;
    async fn refresh_movie(&self, movie_id: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    movie_id: Option<i64>,
}

pub struct RefreshMetadataHandler {
    source: Arc<dyn MetadataSource>,
}

impl RefreshMetadataHandler {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self { source }
    }
}

#[async_trait]
impl TaskHandler for RefreshMetadataHandler {
    fn name(&self) -> &str {
        COMMAND
    }

    fn description(&self) -> &str {
        "Refresh movie metadata from the metadata provider"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let body: RefreshBody = task.body_as()?;
        let ids = match body.movie_id {
            Some(id) => vec![id],
            None => self.source.monitored_movie_ids().await?,
        };

        let source = &self.source;
        for_each_id(ctx, progress, "movie", &ids, |id| source.refresh_movie(id)).await
    }
}
