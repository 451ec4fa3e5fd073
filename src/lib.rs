//! A Tokio-based bounded-concurrency pool that runs an ordered batch of
//! fallible futures, retries failing tasks, and returns order-preserving
//! per-task outcomes with an aggregate partial-failure flag.

mod error;
mod handle;
mod notifier;
mod options;
mod outcome;
mod pool;
mod run;
mod task;

pub use error::{PoolError, TaskError};
pub use handle::RunHandle;
pub use notifier::{TaskCompletionInfo, TaskCompletionStatus};
pub use options::{RunOptions, DEFAULT_LIMIT, DEFAULT_MAX_RETRIES};
pub use outcome::{AggregateResult, TaskOutcome, TaskStatus};
pub use pool::{run_in_task_pool, ShutdownMode, TaskPool};
pub use task::TaskToExecute;
