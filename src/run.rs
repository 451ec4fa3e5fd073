use crate::error::{PoolError, TaskError};
use crate::notifier::{CompletionSink, InternalCompletionMessage, TaskCompletionStatus};
use crate::options::RunOptions;
use crate::pool::RunRegistration;
use crate::outcome::{AggregateResult, TaskOutcome, TaskStatus};
use crate::task::{panic_message, ExecutionUnit, UnitCompletion};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::runtime::Handle as TokioHandle;
use tokio::task::{Id as UnitId, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Best-effort counters of a run, written only by its coordinator.
#[derive(Debug)]
pub(crate) struct RunProgress {
  pub(crate) total: usize,
  pub(crate) in_flight: AtomicUsize,
  pub(crate) completed: AtomicUsize,
}

impl RunProgress {
  pub(crate) fn new(total: usize) -> Self {
    Self {
      total,
      in_flight: AtomicUsize::new(0),
      completed: AtomicUsize::new(0),
    }
  }

  pub(crate) fn in_flight(&self) -> usize {
    self.in_flight.load(AtomicOrdering::Relaxed)
  }

  pub(crate) fn completed(&self) -> usize {
    self.completed.load(AtomicOrdering::Relaxed)
  }
}

/// Cancellation wiring of a single run.
#[derive(Debug, Clone)]
pub(crate) struct RunTokens {
  /// Stops admission and retries.
  pub(crate) stop: CancellationToken,
  /// Abandons in-flight attempts.
  pub(crate) abort: CancellationToken,
}

enum RunEvent<R, E> {
  AdmissionClosed,
  Completed(Option<Result<(tokio::task::Id, UnitCompletion<R, E>), JoinError>>),
}

/// Coordinator state for one invocation.
///
/// Owns every piece of shared run state (`in_flight`, `next_to_admit`,
/// `completed`, `outcomes`) and the execution units themselves. Units are
/// joined here, so slot accounting is serialized through this single task,
/// and dropping the coordinator aborts every unit it started.
pub(crate) struct PoolRun<T, F, R, E> {
  pub(crate) run_id: u64,
  pool_name: Arc<String>,
  limit: usize,
  max_retries: usize,
  pending: std::vec::IntoIter<T>,
  next_to_admit: usize,
  in_flight: usize,
  completed: usize,
  has_partial_error: bool,
  outcomes: Vec<TaskOutcome<R, E>>,
  execute: Arc<F>,
  progress: Arc<RunProgress>,
  tokens: RunTokens,
  units: JoinSet<UnitCompletion<R, E>>,
  unit_indices: HashMap<UnitId, usize>,
  sink: CompletionSink,
  tokio_handle: TokioHandle,
  _registration: RunRegistration,
}

pub(crate) struct RunParts {
  pub(crate) run_id: u64,
  pub(crate) pool_name: Arc<String>,
  pub(crate) tokens: RunTokens,
  pub(crate) progress: Arc<RunProgress>,
  pub(crate) sink: CompletionSink,
  pub(crate) tokio_handle: TokioHandle,
  /// Deregisters the run from its pool when the coordinator is dropped.
  pub(crate) registration: RunRegistration,
}

impl<T, F, R, E, Fut> PoolRun<T, F, R, E>
where
  T: Clone + Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
  F: Fn(T, usize) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
{
  pub(crate) fn new(inputs: Vec<T>, execute: F, options: RunOptions, parts: RunParts) -> Self {
    let total = inputs.len();
    Self {
      run_id: parts.run_id,
      pool_name: parts.pool_name,
      limit: options.effective_limit(total),
      max_retries: options.max_retries,
      pending: inputs.into_iter(),
      next_to_admit: 0,
      in_flight: 0,
      completed: 0,
      has_partial_error: false,
      outcomes: (0..total).map(|_| TaskOutcome::pending()).collect(),
      execute: Arc::new(execute),
      progress: parts.progress,
      tokens: parts.tokens,
      units: JoinSet::new(),
      unit_indices: HashMap::with_capacity(total.min(options.limit)),
      sink: parts.sink,
      tokio_handle: parts.tokio_handle,
      _registration: parts.registration,
    }
  }

  pub(crate) fn progress(&self) -> Arc<RunProgress> {
    self.progress.clone()
  }

  /// Drives the run until every task is terminal.
  pub(crate) async fn drive(self) -> Result<AggregateResult<R, E>, PoolError> {
    let span = info_span!("task_pool_run", pool_name = %*self.pool_name, run_id = self.run_id);
    self.drive_inner().instrument(span).await
  }

  async fn drive_inner(mut self) -> Result<AggregateResult<R, E>, PoolError> {
    let total = self.outcomes.len();
    if total == 0 {
      debug!("Empty input, nothing to run.");
      return Ok(AggregateResult::empty());
    }

    info!(
      total,
      limit = self.limit,
      max_retries = self.max_retries,
      "Run started."
    );

    let stop_token = self.tokens.stop.clone();
    if !stop_token.is_cancelled() {
      for _ in 0..self.limit {
        self.admit_next();
      }
    }

    let mut admission_closed = false;

    while self.completed < total {
      let event = tokio::select! {
        biased;
        _ = stop_token.cancelled(), if !admission_closed => RunEvent::AdmissionClosed,
        joined = self.units.join_next_with_id() => RunEvent::Completed(joined),
      };

      match event {
        RunEvent::AdmissionClosed => {
          admission_closed = true;
          self.cancel_unadmitted().await;
        }
        RunEvent::Completed(Some(joined)) => {
          let completion = match joined {
            Ok((unit_id, completion)) => {
              self.unit_indices.remove(&unit_id);
              completion
            }
            Err(join_error) => match self.unit_indices.remove(&join_error.id()) {
              Some(index) => lost_unit_completion(index, join_error),
              None => {
                error!(%join_error, "Unknown execution unit ended abnormally.");
                continue;
              }
            },
          };
          self.record(completion).await;
          if self.completed < total && !admission_closed {
            self.admit_next();
          }
        }
        RunEvent::Completed(None) => {
          error!(
            in_flight = self.in_flight,
            completed = self.completed,
            "No execution unit left before every task finished."
          );
          return Err(PoolError::ResultChannelError(format!(
            "run {} has no units left with {} of {} tasks unfinished",
            self.run_id,
            total - self.completed,
            total
          )));
        }
      }
    }

    info!(
      total,
      has_partial_error = self.has_partial_error,
      "Run finished."
    );

    Ok(AggregateResult {
      has_partial_error: Some(self.has_partial_error),
      results: self.outcomes,
    })
  }

  /// Starts the first attempt of the lowest not-yet-admitted index.
  fn admit_next(&mut self) -> bool {
    let Some(input) = self.pending.next() else {
      return false;
    };
    let index = self.next_to_admit;
    self.next_to_admit += 1;
    self.in_flight += 1;
    self.outcomes[index].status = TaskStatus::Running;
    self.progress.in_flight.store(self.in_flight, AtomicOrdering::Relaxed);
    debug!(%index, in_flight = self.in_flight, "Admitting task.");

    let unit = ExecutionUnit {
      index,
      input,
      execute: self.execute.clone(),
      max_retries: self.max_retries,
      stop_token: self.tokens.stop.clone(),
      abort_token: self.tokens.abort.clone(),
    };
    let abort_handle = self
      .units
      .spawn_on(unit.run().instrument(info_span!("task_unit", %index)), &self.tokio_handle);
    self.unit_indices.insert(abort_handle.id(), index);
    true
  }

  async fn record(&mut self, completion: UnitCompletion<R, E>) {
    let index = completion.index;
    self.in_flight -= 1;
    self.completed += 1;
    if completion.status == TaskStatus::PermanentlyFailed {
      self.has_partial_error = true;
    }
    self.progress.in_flight.store(self.in_flight, AtomicOrdering::Relaxed);
    self.progress.completed.store(self.completed, AtomicOrdering::Relaxed);
    debug!(
      %index,
      status = ?completion.status,
      retry_count = completion.retry_count,
      in_flight = self.in_flight,
      completed = self.completed,
      "Task reached a terminal state."
    );

    let status = completion.status;
    let retry_count = completion.retry_count;
    self.outcomes[index] = TaskOutcome {
      status,
      retry_count,
      value: completion.value,
      error: completion.error,
    };
    if let Some(message) = self.completion_message(index, status, retry_count) {
      self.sink.publish(message).await;
    }
  }

  /// Marks every task that was never admitted as cancelled.
  async fn cancel_unadmitted(&mut self) {
    let remaining = self.outcomes.len() - self.next_to_admit;
    info!(
      remaining,
      in_flight = self.in_flight,
      "Cancellation requested; no further tasks will be admitted."
    );
    while self.pending.next().is_some() {
      let index = self.next_to_admit;
      self.next_to_admit += 1;
      self.completed += 1;
      self.outcomes[index].status = TaskStatus::Cancelled;
      if let Some(message) = self.completion_message(index, TaskStatus::Cancelled, 0) {
        self.sink.publish(message).await;
      }
    }
    self.progress.completed.store(self.completed, AtomicOrdering::Relaxed);
  }

  fn completion_message(&self, index: usize, status: TaskStatus, retry_count: usize) -> Option<InternalCompletionMessage> {
    let status = TaskCompletionStatus::try_from(status).ok()?;
    Some(InternalCompletionMessage {
      run_id: self.run_id,
      task_index: index,
      pool_name: self.pool_name.clone(),
      status,
      retry_count,
    })
  }
}

/// Terminal outcome for a unit whose task ended without reporting: it
/// panicked outside an attempt (e.g. while dropping an abandoned attempt) or
/// was aborted by the runtime.
fn lost_unit_completion<R, E>(index: usize, join_error: JoinError) -> UnitCompletion<R, E> {
  if join_error.is_panic() {
    let message = panic_message(join_error.into_panic().as_ref());
    warn!(%index, %message, "Execution unit panicked outside an attempt.");
    UnitCompletion {
      index,
      status: TaskStatus::PermanentlyFailed,
      retry_count: 0,
      value: None,
      error: Some(TaskError::Panicked(message)),
    }
  } else {
    warn!(%index, "Execution unit was aborted before reporting.");
    UnitCompletion {
      index,
      status: TaskStatus::Cancelled,
      retry_count: 0,
      value: None,
      error: None,
    }
  }
}
