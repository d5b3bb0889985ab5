//! Movie searches: the periodic wanted-list sweep and on-demand searches.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::HandlerError;
use crate::handlers::for_each_id;
use crate::tasks::{ProgressReporter, Task, TaskContext, TaskHandler};

pub const WANTED_COMMAND: &str = "RefreshWantedMovies";
pub const SEARCH_COMMAND: &str = "AutomaticSearch";

/// Indexer search service.
#[async_trait]
pub trait MovieSearcher: Send + Sync {
    /// Monitored movies that are missing or below their quality cutoff.
    async fn wanted_movie_ids(&self) -> anyhow::Result<Vec<i64>>;
    async fn search_movie(&self, movie_id: i64) -> anyhow::Result<()>;
}

/// Searches every wanted movie.
pub struct WantedMoviesHandler {
    searcher: Arc<dyn MovieSearcher>,
}

impl WantedMoviesHandler {
    pub fn new(searcher: Arc<dyn MovieSearcher>) -> Self {
        Self { searcher }
    }
}

#[async_trait]
impl TaskHandler for WantedMoviesHandler {
    fn name(&self) -> &str {
        WANTED_COMMAND
    }

    fn description(&self) -> &str {
        "Search indexers for every wanted movie"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let ids = self.searcher.wanted_movie_ids().await?;
        tracing::info!(task_id = ctx.task_id, wanted = ids.len(), "Searching wanted movies");

        let searcher = &self.searcher;
        for_each_id(ctx, progress, "movie", &ids, |id| searcher.search_movie(id)).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    movie_ids: Vec<i64>,
}

/// Searches an explicit set of movies.
pub struct AutomaticSearchHandler {
    searcher: Arc<dyn MovieSearcher>,
}

impl AutomaticSearchHandler {
    pub fn new(searcher: Arc<dyn MovieSearcher>) -> Self {
        Self { searcher }
    }
}

#[async_trait]
impl TaskHandler for AutomaticSearchHandler {
    fn name(&self) -> &str {
        SEARCH_COMMAND
    }

    fn description(&self) -> &str {
        "Search indexers for the given movies"
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        task: &Task,
        progress: &ProgressReporter,
    ) -> Result<(), HandlerError> {
        let body: SearchBody = task.body_as()?;
        if body.movie_ids.is_empty() {
            return Err(HandlerError::InvalidBody(format!(
                "{SEARCH_COMMAND}: movieIds must not be empty"
            )));
        }

        let searcher = &self.searcher;
        for_each_id(ctx, progress, "movie", &body.movie_ids, |id| {
            searcher.search_movie(id)
        })
        .await
    }
}
