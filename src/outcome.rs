use crate::error::{PoolError, TaskError};

/// Lifecycle of one task index within a run.
///
/// `Pending → Running → {Succeeded | PermanentlyFailed | Cancelled}`.
/// Retries keep a task in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
  Pending,
  Running,
  Succeeded,
  PermanentlyFailed,
  Cancelled,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Succeeded | TaskStatus::PermanentlyFailed | TaskStatus::Cancelled
    )
  }
}

/// The recorded result for the task at one input position.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome<R, E> {
  pub status: TaskStatus,
  /// Number of re-attempts made after the first attempt.
  pub retry_count: usize,
  pub value: Option<R>,
  /// The failure of the last attempt, if the task did not succeed.
  ///
  /// Always set for `PermanentlyFailed`. A `Cancelled` task also carries the
  /// error of its last failed attempt when it had failed at least once
  /// before cancellation stopped its retries; it is `None` for tasks that
  /// never ran or were abandoned on their first attempt.
  pub error: Option<TaskError<E>>,
}

impl<R, E> TaskOutcome<R, E> {
  pub(crate) fn pending() -> Self {
    Self {
      status: TaskStatus::Pending,
      retry_count: 0,
      value: None,
      error: None,
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == TaskStatus::Succeeded
  }

  pub fn is_permanently_failed(&self) -> bool {
    self.status == TaskStatus::PermanentlyFailed
  }

  pub fn is_cancelled(&self) -> bool {
    self.status == TaskStatus::Cancelled
  }

  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }
}

/// The aggregated outcome of one run, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult<R, E> {
  /// `None` only for an empty input. Otherwise `Some(true)` iff at least one
  /// task failed permanently.
  pub has_partial_error: Option<bool>,
  pub results: Vec<TaskOutcome<R, E>>,
}

impl<R, E> AggregateResult<R, E> {
  pub(crate) fn empty() -> Self {
    Self {
      has_partial_error: None,
      results: Vec::new(),
    }
  }

  pub fn len(&self) -> usize {
    self.results.len()
  }

  pub fn is_empty(&self) -> bool {
    self.results.is_empty()
  }

  /// Indices of tasks that exhausted their retries.
  pub fn failed_indices(&self) -> Vec<usize> {
    self.indices_where(TaskOutcome::is_permanently_failed)
  }

  /// Indices of tasks that were cancelled before reaching another terminal state.
  pub fn cancelled_indices(&self) -> Vec<usize> {
    self.indices_where(TaskOutcome::is_cancelled)
  }

  /// Successful values in input order; `None` where a task did not succeed.
  pub fn values(&self) -> impl Iterator<Item = Option<&R>> + '_ {
    self.results.iter().map(|outcome| outcome.value.as_ref())
  }

  /// Strict view of the run: every task's value, or an error naming the
  /// indices that failed or were cancelled.
  ///
  /// # Errors
  /// Returns `PoolError::PartialFailure` if any task failed permanently, else
  /// `PoolError::RunCancelled` if any task was cancelled.
  pub fn into_values(self) -> Result<Vec<R>, PoolError> {
    let total = self.results.len();
    let failed = self.failed_indices();
    if !failed.is_empty() {
      return Err(PoolError::PartialFailure { failed, total });
    }
    let cancelled = self.cancelled_indices();
    if !cancelled.is_empty() {
      return Err(PoolError::RunCancelled { cancelled, total });
    }
    Ok(self.results.into_iter().filter_map(|outcome| outcome.value).collect())
  }

  fn indices_where(&self, predicate: impl Fn(&TaskOutcome<R, E>) -> bool) -> Vec<usize> {
    self
      .results
      .iter()
      .enumerate()
      .filter(|(_, outcome)| predicate(outcome))
      .map(|(index, _)| index)
      .collect()
  }
}
