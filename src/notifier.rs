use crate::outcome::TaskStatus;

use fibre::mpsc::{UnboundedAsyncReceiver as AsyncReceiver, UnboundedAsyncSender as AsyncSender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Once};
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

// --- Public Event Structs for Handlers ---

/// Terminal state reported for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompletionStatus {
  Succeeded,
  PermanentlyFailed,
  Cancelled,
}

impl TryFrom<TaskStatus> for TaskCompletionStatus {
  type Error = TaskStatus;

  fn try_from(status: TaskStatus) -> Result<Self, Self::Error> {
    match status {
      TaskStatus::Succeeded => Ok(TaskCompletionStatus::Succeeded),
      TaskStatus::PermanentlyFailed => Ok(TaskCompletionStatus::PermanentlyFailed),
      TaskStatus::Cancelled => Ok(TaskCompletionStatus::Cancelled),
      other => Err(other),
    }
  }
}

#[derive(Debug, Clone)]
pub struct TaskCompletionInfo {
  pub run_id: u64,
  pub task_index: usize,
  pub pool_name: Arc<String>,
  pub status: TaskCompletionStatus,
  pub retry_count: usize,
  pub completion_time: SystemTime,
}

// --- Internal Message (crate-public) ---
#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) run_id: u64,
  pub(crate) task_index: usize,
  pub(crate) pool_name: Arc<String>,
  pub(crate) status: TaskCompletionStatus,
  pub(crate) retry_count: usize,
}

type CompletionHandler = Arc<dyn Fn(TaskCompletionInfo) + Send + Sync + 'static>;

/// Lazily started worker state. The receiver is parked here until the first
/// handler is registered.
struct WorkerSlot {
  pending_rx: Option<AsyncReceiver<InternalCompletionMessage>>,
  tokio_handle: TokioHandle,
  pool_shutdown_token: CancellationToken,
  pool_name: Arc<String>,
  join_handle: Option<JoinHandle<()>>,
}

/// Fans terminal-task events out to registered handlers from a dedicated worker.
pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  started: Once,
  worker: Mutex<WorkerSlot>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |handlers| handlers.len());
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &handler_count)
      .field("started", &self.started.is_completed())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(
    rx: AsyncReceiver<InternalCompletionMessage>,
    tokio_handle: TokioHandle,
    pool_shutdown_token: CancellationToken,
    pool_name: Arc<String>,
  ) -> Arc<Self> {
    Arc::new(Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      started: Once::new(),
      worker: Mutex::new(WorkerSlot {
        pending_rx: Some(rx),
        tokio_handle,
        pool_shutdown_token,
        pool_name,
        join_handle: None,
      }),
    })
  }

  /// `true` once a handler has been registered; until then events are not enqueued.
  pub(crate) fn is_listening(&self) -> bool {
    self.started.is_completed()
  }

  fn start_worker(&self) {
    self.started.call_once(|| {
      let mut slot = self.worker.lock();
      let Some(rx) = slot.pending_rx.take() else {
        warn!(pool_name = %*slot.pool_name, "Notifier worker receiver already taken.");
        return;
      };
      info!(pool_name = %*slot.pool_name, "Starting completion notification worker.");

      let span = info_span!("completion_notifier", pool_name = %*slot.pool_name);
      let worker = Self::dispatch_loop(
        rx,
        self.handlers.clone(),
        slot.tokio_handle.clone(),
        slot.pool_shutdown_token.clone(),
      )
      .instrument(span);
      slot.join_handle = Some(slot.tokio_handle.spawn(worker));
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(TaskCompletionInfo) + Send + Sync + 'static) {
    // Register before starting the worker so the first event already has a listener.
    let handler_count = {
      let mut handlers = self.handlers.write();
      handlers.push(Arc::new(handler));
      handlers.len()
    };
    self.start_worker();

    let pool_name = self.worker.lock().pool_name.clone();
    info!(pool_name = %*pool_name, handler_count, "Completion handler registered.");
  }

  /// Delivers every queued event until all senders are gone.
  async fn dispatch_loop(
    mut rx: AsyncReceiver<InternalCompletionMessage>,
    handlers: Arc<RwLock<Vec<CompletionHandler>>>,
    tokio_handle: TokioHandle,
    pool_shutdown_token: CancellationToken,
  ) {
    debug!("Completion notification worker running.");
    let mut shutdown_seen = false;

    loop {
      tokio::select! {
        biased;

        received = rx.recv() => match received {
          Ok(message) => Self::dispatch(message, &handlers, &tokio_handle),
          Err(receive_error) => {
            debug!(error = ?receive_error, "All completion senders dropped and queue drained.");
            break;
          }
        },
        // Shutdown does not end the loop: events from runs still draining must be delivered.
        _ = pool_shutdown_token.cancelled(), if !shutdown_seen => {
          debug!("Pool shutdown observed by notification worker.");
          shutdown_seen = true;
        }
      }
    }

    info!("Completion notification worker stopped.");
  }

  fn dispatch(message: InternalCompletionMessage, handlers: &RwLock<Vec<CompletionHandler>>, tokio_handle: &TokioHandle) {
    let snapshot: Vec<CompletionHandler> = handlers.read().clone();
    if snapshot.is_empty() {
      trace!(run_id = message.run_id, task_index = message.task_index, "No handlers; event dropped.");
      return;
    }

    let info = TaskCompletionInfo {
      run_id: message.run_id,
      task_index: message.task_index,
      pool_name: message.pool_name,
      status: message.status,
      retry_count: message.retry_count,
      completion_time: SystemTime::now(),
    };
    trace!(
      run_id = info.run_id,
      task_index = info.task_index,
      status = ?info.status,
      handlers = snapshot.len(),
      "Dispatching completion event."
    );

    for handler in snapshot {
      let info = info.clone();
      tokio_handle.spawn(async move {
        let (run_id, task_index) = (info.run_id, info.task_index);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info)));
        if outcome.is_err() {
          error!(%run_id, %task_index, "A completion handler panicked.");
        }
      });
    }
  }

  /// Waits for the worker to finish. It finishes once every sender is dropped.
  pub(crate) async fn await_shutdown(&self) {
    let (join_handle, pool_name) = {
      let mut slot = self.worker.lock();
      (slot.join_handle.take(), slot.pool_name.clone())
    };

    let Some(join_handle) = join_handle else {
      trace!(pool_name = %*pool_name, "Notifier worker never started; nothing to join.");
      return;
    };
    debug!(pool_name = %*pool_name, "Waiting for notification worker to stop.");
    if let Err(join_error) = join_handle.await {
      error!(pool_name = %*pool_name, "Notification worker ended abnormally: {:?}", join_error);
    }
  }
}

/// The sending half a run uses to report terminal tasks to the notifier.
#[derive(Clone)]
pub(crate) struct CompletionSink {
  notifier: Arc<CompletionNotifier>,
  tx: AsyncSender<InternalCompletionMessage>,
}

impl fmt::Debug for CompletionSink {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CompletionSink")
      .field("notifier", &self.notifier)
      .finish_non_exhaustive()
  }
}

impl CompletionSink {
  pub(crate) fn new(notifier: Arc<CompletionNotifier>, tx: AsyncSender<InternalCompletionMessage>) -> Self {
    Self { notifier, tx }
  }

  pub(crate) async fn publish(&self, message: InternalCompletionMessage) {
    if !self.notifier.is_listening() {
      return;
    }
    if self.tx.send(message).await.is_err() {
      trace!("Notifier queue closed; completion event dropped.");
    }
  }
}
