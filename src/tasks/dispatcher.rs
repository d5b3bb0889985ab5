//! Dispatcher — persists new tasks and routes them to the worker pools.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::model::{NewTask, Task};
use crate::tasks::pool::{EnqueueError, PoolKind, PoolStatus, WorkerPool};

/// Owns the pool map and the queueing path shared by manual requests,
/// the scheduler and the reconciler.
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    pools: RwLock<HashMap<PoolKind, Arc<WorkerPool>>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Install a pool for its kind, replacing any previous one.
    pub async fn add_pool(&self, pool: Arc<WorkerPool>) {
        self.pools.write().await.insert(pool.kind(), pool);
    }

    pub async fn pool(&self, kind: PoolKind) -> Option<Arc<WorkerPool>> {
        self.pools.read().await.get(&kind).cloned()
    }

    pub async fn pools(&self) -> Vec<Arc<WorkerPool>> {
        let mut pools: Vec<Arc<WorkerPool>> = self.pools.read().await.values().cloned().collect();
        pools.sort_by_key(|p| p.kind());
        pools
    }

    /// Persist a `queued` row, then offer it to its pool without blocking.
    ///
    /// A full inbound queue does not fail the call: the row stays `queued`
    /// and the reconciler picks it up later.
    pub async fn queue_task(&self, new_task: NewTask) -> Result<Task, DatabaseError> {
        let task = self.store.insert_task(&new_task).await?;
        tracing::info!(
            task_id = task.id,
            command = %task.command_name,
            priority = %task.priority,
            trigger = %task.trigger,
            "Task queued"
        );
        self.offer(task.clone()).await;
        Ok(task)
    }

    /// Re-offer an existing `queued` row. Skipped if a pool already holds it.
    pub async fn redispatch(&self, task: Task) -> bool {
        if self.is_tracking(task.id).await {
            return false;
        }
        self.offer(task).await
    }

    /// Whether any pool has the task waiting or running.
    pub async fn is_tracking(&self, task_id: i64) -> bool {
        for pool in self.pools.read().await.values() {
            if pool.is_tracking(task_id).await {
                return true;
            }
        }
        false
    }

    /// Push a cancellation signal to whichever pool runs the task.
    pub async fn signal_cancel(&self, task_id: i64) -> bool {
        for pool in self.pools.read().await.values() {
            if pool.cancel(task_id).await {
                return true;
            }
        }
        false
    }

    /// Status of every pool, keyed by pool name.
    pub async fn queue_status(&self) -> BTreeMap<String, PoolStatus> {
        let mut status = BTreeMap::new();
        for (kind, pool) in self.pools.read().await.iter() {
            status.insert(kind.to_string(), pool.status().await);
        }
        status
    }

    async fn offer(&self, task: Task) -> bool {
        let kind = PoolKind::for_priority(task.priority);
        let Some(pool) = self.pool(kind).await else {
            tracing::warn!(task_id = task.id, pool = %kind, "No pool for task; left queued");
            return false;
        };

        let task_id = task.id;
        match pool.try_enqueue(task).await {
            Ok(()) => true,
            Err(EnqueueError::QueueFull) => {
                tracing::warn!(
                    task_id,
                    pool = %kind,
                    "Pool queue full; task left queued for the reconciler"
                );
                false
            }
            Err(EnqueueError::Closed) => {
                tracing::debug!(task_id, pool = %kind, "Pool closed; task left queued");
                false
            }
        }
    }
}
