use crate::error::PoolError;

/// Concurrency ceiling used when none is configured.
pub const DEFAULT_LIMIT: usize = 6;

/// Retries per task (after its first attempt) used when none are configured.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Options recognised by a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
  /// Maximum number of tasks executing at once. Clamped to the input length.
  pub limit: usize,
  /// How many times a failing task is re-attempted before it is marked
  /// permanently failed.
  pub max_retries: usize,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      limit: DEFAULT_LIMIT,
      max_retries: DEFAULT_MAX_RETRIES,
    }
  }
}

impl RunOptions {
  pub fn new(limit: usize, max_retries: usize) -> Self {
    Self { limit, max_retries }
  }

  pub fn with_limit(mut self, limit: usize) -> Self {
    self.limit = limit;
    self
  }

  pub fn with_max_retries(mut self, max_retries: usize) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// Checks the options before any task is started.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidArgument` if `limit` is zero, since no task
  /// could ever be admitted.
  pub fn validate(&self) -> Result<(), PoolError> {
    if self.limit == 0 {
      return Err(PoolError::InvalidArgument(
        "limit must be at least 1".to_string(),
      ));
    }
    Ok(())
  }

  /// The concurrency ceiling actually applied to a run of `task_count` tasks.
  pub fn effective_limit(&self, task_count: usize) -> usize {
    self.limit.min(task_count)
  }
}
