use crate::error::PoolError;
use crate::outcome::AggregateResult;
use crate::pool::ShutdownMode;
use crate::run::{RunProgress, RunTokens};

use std::sync::Arc;
use tokio::sync::oneshot;
use tracing;

/// A handle to a run started with [`TaskPool::spawn_run`](crate::TaskPool::spawn_run).
///
/// Allows for observing progress, requesting cancellation and awaiting the
/// aggregated result.
#[derive(Debug)]
pub struct RunHandle<R: Send + 'static, E: Send + 'static> {
  pub(crate) run_id: u64,
  pub(crate) progress: Arc<RunProgress>,
  pub(crate) tokens: RunTokens,
  pub(crate) result_receiver: Option<oneshot::Receiver<Result<AggregateResult<R, E>, PoolError>>>,
}

impl<R: Send + 'static, E: Send + 'static> RunHandle<R, E> {
  /// Returns the unique ID of this run.
  pub fn id(&self) -> u64 {
    self.run_id
  }

  /// Number of tasks in this run.
  pub fn total(&self) -> usize {
    self.progress.total
  }

  /// Tasks currently executing. Advisory only.
  pub fn in_flight(&self) -> usize {
    self.progress.in_flight()
  }

  /// Tasks that have reached a terminal state. Advisory only.
  pub fn completed(&self) -> usize {
    self.progress.completed()
  }

  pub fn is_cancellation_requested(&self) -> bool {
    self.tokens.stop.is_cancelled()
  }

  /// Requests cancellation of this run.
  ///
  /// No further tasks are admitted or retried. With
  /// `ShutdownMode::ForcefulCancel` running attempts are abandoned as well.
  pub fn cancel(&self, mode: ShutdownMode) {
    tracing::debug!(run_id = %self.run_id, ?mode, "RunHandle: Cancellation requested.");
    self.tokens.stop.cancel();
    if mode == ShutdownMode::ForcefulCancel {
      self.tokens.abort.cancel();
    }
  }

  /// Awaits the end of the run and returns its aggregated result.
  ///
  /// # Errors
  /// Returns `PoolError::ResultChannelError` if the coordinator went away without reporting.
  /// Returns `PoolError::ResultUnavailable` if the result has already been taken.
  pub async fn await_result(&mut self) -> Result<AggregateResult<R, E>, PoolError> {
    match self.result_receiver.take() {
      Some(rx) => match rx.await {
        Ok(run_result) => run_result,
        Err(recv_error) => {
          tracing::warn!(run_id = %self.run_id, "Run result channel receive error: {}", recv_error);
          Err(PoolError::ResultChannelError(format!(
            "Run (id: {}) result channel unexpectedly closed: {}",
            self.run_id, recv_error
          )))
        }
      },
      None => Err(PoolError::ResultUnavailable),
    }
  }
}
