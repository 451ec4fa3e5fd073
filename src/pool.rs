use crate::error::PoolError;
use crate::handle::RunHandle;
use crate::notifier::{CompletionNotifier, CompletionSink, InternalCompletionMessage, TaskCompletionInfo};
use crate::options::RunOptions;
use crate::outcome::AggregateResult;
use crate::run::{PoolRun, RunParts, RunProgress, RunTokens};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use fibre::mpsc::{self as fibre_mpsc, UnboundedAsyncSender as AsyncSender};
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

lazy_static::lazy_static! {
  static ref NEXT_RUN_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Defines how runs should behave upon cancellation or pool shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops admitting and retrying tasks; attempts already running finish.
  /// Tasks that never started are recorded as cancelled.
  Graceful,
  /// Additionally abandons attempts that are currently running.
  ForcefulCancel,
}

/// Bookkeeping for a run that has not finished yet.
#[derive(Debug)]
struct ActiveRun {
  progress: Arc<RunProgress>,
  /// Cancelled by the run itself when its coordinator finishes or is dropped.
  finished: CancellationToken,
}

/// Keeps a run listed in its pool's active-run registry while the run's
/// coordinator is alive.
pub(crate) struct RunRegistration {
  run_id: u64,
  pool_name: Arc<String>,
  active_runs: Arc<DashMap<u64, ActiveRun>>,
  finished: CancellationToken,
}

impl Drop for RunRegistration {
  fn drop(&mut self) {
    self.active_runs.remove(&self.run_id);
    self.finished.cancel();
    trace!(pool_name = %*self.pool_name, run_id = %self.run_id, "Run finished, removed active info.");
  }
}

/// A bounded-concurrency executor for ordered batches of fallible tasks.
///
/// Each call to [`run`](TaskPool::run) executes at most `limit` tasks at
/// once, retries failing tasks up to `max_retries` times, and returns one
/// outcome per input in input order. Runs are independent of each other;
/// the pool only shares its name, runtime handle, cancellation and
/// completion notifications between them.
pub struct TaskPool {
  pool_name: Arc<String>,
  default_options: RunOptions,
  tokio_handle: TokioHandle,
  active_runs: Arc<DashMap<u64, ActiveRun>>,
  shutdown_token: CancellationToken,
  abort_token: CancellationToken,
  notifier: Arc<CompletionNotifier>,
  notifier_tx: Mutex<Option<AsyncSender<InternalCompletionMessage>>>,
}

impl fmt::Debug for TaskPool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskPool")
      .field("pool_name", &self.pool_name)
      .field("default_options", &self.default_options)
      .field("active_runs", &self.active_runs.len())
      .field("shutting_down", &self.shutdown_token.is_cancelled())
      .field("notifier", &self.notifier)
      .finish_non_exhaustive()
  }
}

impl TaskPool {
  pub fn new(default_options: RunOptions, tokio_handle: TokioHandle, pool_name: &str) -> Arc<Self> {
    let pool_name = Arc::new(pool_name.to_string());
    let shutdown_token = CancellationToken::new();
    let (notifier_tx, notifier_rx) = fibre_mpsc::unbounded_async();
    let notifier = CompletionNotifier::new(
      notifier_rx,
      tokio_handle.clone(),
      shutdown_token.clone(),
      pool_name.clone(),
    );

    debug!(pool_name = %*pool_name, ?default_options, "Task pool created.");

    Arc::new(Self {
      pool_name,
      default_options,
      tokio_handle,
      active_runs: Arc::new(DashMap::new()),
      shutdown_token,
      abort_token: CancellationToken::new(),
      notifier,
      notifier_tx: Mutex::new(Some(notifier_tx)),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn default_options(&self) -> RunOptions {
    self.default_options
  }

  /// Number of runs that have started and not yet finished.
  pub fn active_run_count(&self) -> usize {
    self.active_runs.len()
  }

  /// Tasks currently executing across all active runs. Advisory only.
  pub fn active_task_count(&self) -> usize {
    self.active_runs.iter().map(|entry| entry.value().progress.in_flight()).sum()
  }

  pub fn is_shutting_down(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Registers a handler invoked once for every task that reaches a terminal state.
  ///
  /// Handlers run on the pool's runtime, off the run's critical path. A
  /// panicking handler is logged and does not affect other handlers or runs.
  pub fn on_completion(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    self.notifier.add_handler(handler);
  }

  /// Runs every input through `execute` using the pool's default options.
  pub async fn run<T, R, E, F, Fut>(&self, inputs: Vec<T>, execute: F) -> Result<AggregateResult<R, E>, PoolError>
  where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    self.run_with_options(inputs, execute, self.default_options).await
  }

  /// Runs every input through `execute` with at most `options.limit` tasks in
  /// flight, retrying each failing task up to `options.max_retries` times.
  ///
  /// Task failures never fail the call; they are reported in the returned
  /// [`AggregateResult`].
  ///
  /// # Errors
  /// Returns `PoolError::InvalidArgument` if the options are invalid and
  /// `PoolError::PoolShuttingDown` if the pool has been shut down. No task is
  /// started in either case.
  pub async fn run_with_options<T, R, E, F, Fut>(
    &self,
    inputs: Vec<T>,
    execute: F,
    options: RunOptions,
  ) -> Result<AggregateResult<R, E>, PoolError>
  where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    let (run, _tokens) = self.prepare_run(inputs, execute, options)?;
    run.drive().await
  }

  /// Starts a run in the background and returns a handle to it.
  ///
  /// # Errors
  /// Same as [`run_with_options`](TaskPool::run_with_options).
  pub fn spawn_run<T, R, E, F, Fut>(
    &self,
    inputs: Vec<T>,
    execute: F,
    options: RunOptions,
  ) -> Result<RunHandle<R, E>, PoolError>
  where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    let (run, tokens) = self.prepare_run(inputs, execute, options)?;
    let run_id = run.run_id;
    let progress = run.progress();
    let (result_tx, result_rx) = oneshot::channel();

    self.tokio_handle.spawn(async move {
      let run_result = run.drive().await;
      if result_tx.send(run_result).is_err() {
        trace!(%run_id, "Run handle was dropped; result discarded.");
      }
    });

    Ok(RunHandle {
      run_id,
      progress,
      tokens,
      result_receiver: Some(result_rx),
    })
  }

  fn prepare_run<T, R, E, F, Fut>(
    &self,
    inputs: Vec<T>,
    execute: F,
    options: RunOptions,
  ) -> Result<(PoolRun<T, F, R, E>, RunTokens), PoolError>
  where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    F: Fn(T, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
  {
    options.validate()?;

    let notifier_tx = match self.notifier_tx.lock().as_ref() {
      Some(tx) if !self.shutdown_token.is_cancelled() => tx.clone(),
      _ => {
        warn!(pool_name = %self.pool_name, "Run: Attempted to start a run on a pool that is shutting down.");
        return Err(PoolError::PoolShuttingDown);
      }
    };

    let run_id = NEXT_RUN_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
    let tokens = RunTokens {
      stop: self.shutdown_token.child_token(),
      abort: self.abort_token.child_token(),
    };
    let finished = CancellationToken::new();
    let progress = Arc::new(RunProgress::new(inputs.len()));

    self.active_runs.insert(
      run_id,
      ActiveRun {
        progress: progress.clone(),
        finished: finished.clone(),
      },
    );
    let registration = RunRegistration {
      run_id,
      pool_name: self.pool_name.clone(),
      active_runs: self.active_runs.clone(),
      finished,
    };

    let run = PoolRun::new(
      inputs,
      execute,
      options,
      RunParts {
        run_id,
        pool_name: self.pool_name.clone(),
        tokens: tokens.clone(),
        progress,
        sink: CompletionSink::new(self.notifier.clone(), notifier_tx),
        tokio_handle: self.tokio_handle.clone(),
        registration,
      },
    );

    debug!(pool_name = %self.pool_name, %run_id, ?options, "Run prepared.");
    Ok((run, tokens))
  }

  /// Shuts the pool down: every active run is cancelled according to `mode`,
  /// later runs are rejected, and the call waits for active runs and the
  /// notification worker to finish.
  pub async fn shutdown(self: Arc<Self>, mode: ShutdownMode) -> Result<(), PoolError> {
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Initiating explicit pool shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
      if mode == ShutdownMode::ForcefulCancel {
        info!(pool_name = %self.pool_name, "Forceful shutdown: Abandoning running attempts.");
        self.abort_token.cancel();
      } else {
        info!(pool_name = %self.pool_name, "Graceful shutdown: Allowing running attempts to complete.");
      }
    } else {
      info!(pool_name = %self.pool_name, "Shutdown already in progress or initiated by another call/Drop.");
      if mode == ShutdownMode::ForcefulCancel {
        self.abort_token.cancel();
      }
    }

    let runs_to_await: Vec<(u64, CancellationToken)> = self
      .active_runs
      .iter()
      .map(|entry| (*entry.key(), entry.value().finished.clone()))
      .collect();

    for (run_id, finished) in runs_to_await {
      debug!(pool_name = %self.pool_name, %run_id, "Waiting for run to finish.");
      finished.cancelled().await;
    }

    // Dropping the pool's sender lets the notification worker drain and stop
    // once the last run's sender is gone.
    let sender = self.notifier_tx.lock().take();
    drop(sender);
    self.notifier.await_shutdown().await;

    if !already_initiating_shutdown {
      info!(pool_name = %self.pool_name, "Pool shutdown process completed by this call.");
    }
    Ok(())
  }
}

impl Drop for TaskPool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        pool_name = %*self.pool_name,
        "TaskPool instance dropped. Signalling graceful cancellation of any spawned runs."
      );
      self.shutdown_token.cancel();
    } else {
      trace!(
        pool_name = %*self.pool_name,
        "Drop: Shutdown already in progress or completed. No new signals sent."
      );
    }
  }
}

/// Runs `inputs` through `execute` on a temporary pool bound to the current
/// Tokio runtime.
///
/// # Errors
/// Returns `PoolError::InvalidArgument` when called outside a Tokio runtime
/// or with invalid options.
pub async fn run_in_task_pool<T, R, E, F, Fut>(
  inputs: Vec<T>,
  execute: F,
  options: RunOptions,
) -> Result<AggregateResult<R, E>, PoolError>
where
  T: Clone + Send + 'static,
  R: Send + 'static,
  E: Send + 'static,
  F: Fn(T, usize) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<R, E>> + Send + 'static,
{
  let tokio_handle = TokioHandle::try_current()
    .map_err(|e| PoolError::InvalidArgument(format!("no Tokio runtime available: {}", e)))?;
  let pool = TaskPool::new(options, tokio_handle, "run_in_task_pool");
  pool.run(inputs, execute).await
}
