//! Task engine — persistent queueing, priority pools, recurring work and
//! cooperative cancellation.

pub mod dispatcher;
pub mod handler;
pub mod model;
pub mod pool;
pub mod reconciler;
pub mod scheduler;
pub mod service;

pub use handler::{HandlerInfo, HandlerRegistry, ProgressReporter, TaskContext, TaskHandler};
pub use model::{
    NewScheduledTask, NewTask, ScheduledTask, ScheduledTaskPatch, Task, TaskBody, TaskFilter,
    TaskPage, TaskPriority, TaskProgress, TaskStatus, TaskTrigger,
};
pub use pool::{PoolKind, PoolStatus};
pub use service::TaskService;
