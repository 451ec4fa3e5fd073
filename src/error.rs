use thiserror::Error;

/// Errors that can occur within the `run_in_task_pool` pool.
///
/// Individual task failures never surface here; they are recorded in the
/// per-index [`TaskOutcome`](crate::TaskOutcome) instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Invalid argument: {0}")]
  InvalidArgument(String),

  #[error("Pool is shutting down or already shut down, cannot start new runs")]
  PoolShuttingDown,

  #[error("Run result channel error (coordinator might have been dropped): {0}")]
  ResultChannelError(String),

  #[error("Run result already taken or channel was not available")]
  ResultUnavailable,

  #[error("{count} of {total} tasks failed permanently (indices {failed:?})", count = .failed.len())]
  PartialFailure { failed: Vec<usize>, total: usize },

  #[error("{count} of {total} tasks were cancelled (indices {cancelled:?})", count = .cancelled.len())]
  RunCancelled { cancelled: Vec<usize>, total: usize },
}

/// The failure recorded for a single attempt of a task.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
  /// The execute operation returned an error.
  #[error("{0}")]
  Failed(E),

  /// The attempt panicked. The payload message is kept when it is a string.
  #[error("Task attempt panicked: {0}")]
  Panicked(String),
}

impl<E> TaskError<E> {
  /// Returns the caller's error value, if this failure was not a panic.
  pub fn as_failed(&self) -> Option<&E> {
    match self {
      TaskError::Failed(e) => Some(e),
      TaskError::Panicked(_) => None,
    }
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskError::Panicked(_))
  }
}
