use crate::error::TaskError;
use crate::outcome::TaskStatus;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// A boxed attempt future, for callers that need to name the future type of
/// their execute operation (e.g. to store closures with different bodies).
pub type TaskToExecute<R, E> = Pin<Box<dyn Future<Output = Result<R, E>> + Send + 'static>>;

/// Terminal report sent by an execution unit back to its run's coordinator.
#[derive(Debug)]
pub(crate) struct UnitCompletion<R, E> {
  pub(crate) index: usize,
  pub(crate) status: TaskStatus,
  pub(crate) retry_count: usize,
  pub(crate) value: Option<R>,
  pub(crate) error: Option<TaskError<E>>,
}

/// One admitted task: owns its input and drives attempts until the task is terminal.
///
/// A unit holds its slot for its whole lifetime, so retries never yield the
/// slot to another task.
pub(crate) struct ExecutionUnit<T, F> {
  pub(crate) index: usize,
  pub(crate) input: T,
  pub(crate) execute: Arc<F>,
  pub(crate) max_retries: usize,
  /// Cancelled on any shutdown: the unit stops retrying.
  pub(crate) stop_token: CancellationToken,
  /// Cancelled on forceful shutdown: the running attempt is abandoned.
  pub(crate) abort_token: CancellationToken,
}

impl<T, F> ExecutionUnit<T, F> {
  pub(crate) async fn run<R, E, Fut>(self) -> UnitCompletion<R, E>
  where
    T: Clone,
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
  {
    let index = self.index;
    let mut retry_count = 0usize;
    let mut last_error: Option<TaskError<E>> = None;

    loop {
      trace!(%index, attempt = retry_count + 1, "Starting attempt.");

      let input = self.input.clone();
      let execute = self.execute.clone();
      let attempt = AssertUnwindSafe(async move { (*execute)(input, index).await }).catch_unwind();

      let attempt_result = tokio::select! {
        biased;
        _ = self.abort_token.cancelled() => {
          debug!(%index, "Attempt abandoned by forceful cancellation.");
          return UnitCompletion {
            index,
            status: TaskStatus::Cancelled,
            retry_count,
            value: None,
            error: last_error,
          };
        }
        result = attempt => result,
      };

      let error = match attempt_result {
        Ok(Ok(value)) => {
          trace!(%index, %retry_count, "Task succeeded.");
          return UnitCompletion {
            index,
            status: TaskStatus::Succeeded,
            retry_count,
            value: Some(value),
            error: None,
          };
        }
        Ok(Err(e)) => TaskError::Failed(e),
        Err(panic_payload) => {
          let message = panic_message(panic_payload.as_ref());
          warn!(%index, %message, "Task attempt panicked.");
          TaskError::Panicked(message)
        }
      };

      if retry_count >= self.max_retries {
        warn!(%index, %retry_count, "Task failed permanently, retries exhausted.");
        return UnitCompletion {
          index,
          status: TaskStatus::PermanentlyFailed,
          retry_count,
          value: None,
          error: Some(error),
        };
      }

      if self.stop_token.is_cancelled() {
        debug!(%index, %retry_count, "Attempt failed after cancellation was requested; not retrying.");
        return UnitCompletion {
          index,
          status: TaskStatus::Cancelled,
          retry_count,
          value: None,
          error: Some(error),
        };
      }

      retry_count += 1;
      last_error = Some(error);
      debug!(%index, %retry_count, max_retries = self.max_retries, "Attempt failed, retrying.");
    }
  }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&'static str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn unit<F, Fut, R, E>(execute: F, max_retries: usize) -> ExecutionUnit<u32, F>
  where
    F: Fn(u32, usize) -> Fut,
    Fut: Future<Output = Result<R, E>>,
  {
    ExecutionUnit {
      index: 0,
      input: 7,
      execute: Arc::new(execute),
      max_retries,
      stop_token: CancellationToken::new(),
      abort_token: CancellationToken::new(),
    }
  }

  #[tokio::test]
  async fn succeeds_on_first_attempt() {
    let completion = unit(|x: u32, _| async move { Ok::<_, String>(x + 1) }, 3).run().await;
    assert_eq!(completion.status, TaskStatus::Succeeded);
    assert_eq!(completion.retry_count, 0);
    assert_eq!(completion.value, Some(8));
    assert!(completion.error.is_none());
  }

  #[tokio::test]
  async fn always_failing_task_is_attempted_max_retries_plus_one_times() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let completion = unit(
      move |_: u32, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<u32, _>("boom".to_string()) }
      },
      2,
    )
    .run()
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(completion.status, TaskStatus::PermanentlyFailed);
    assert_eq!(completion.retry_count, 2);
    assert_eq!(completion.error, Some(TaskError::Failed("boom".to_string())));
  }

  #[tokio::test]
  async fn zero_retries_means_a_single_attempt() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let completion = unit(
      move |_: u32, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<u32, _>(()) }
      },
      0,
    )
    .run()
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(completion.status, TaskStatus::PermanentlyFailed);
    assert_eq!(completion.retry_count, 0);
  }

  #[tokio::test]
  async fn panics_are_caught_and_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let completion = unit(
      move |x: u32, _| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if attempt == 0 {
            panic!("first attempt explodes");
          }
          Ok::<_, ()>(x)
        }
      },
      1,
    )
    .run()
    .await;

    assert_eq!(completion.status, TaskStatus::Succeeded);
    assert_eq!(completion.retry_count, 1);
    assert_eq!(completion.value, Some(7));
  }

  #[tokio::test]
  async fn panic_message_is_recorded() {
    let completion = unit(
      |x: u32, _| async move {
        if x > 0 {
          panic!("exploded");
        }
        Ok::<u32, ()>(x)
      },
      0,
    )
    .run()
    .await;

    assert_eq!(completion.status, TaskStatus::PermanentlyFailed);
    assert_eq!(completion.error, Some(TaskError::Panicked("exploded".to_string())));
  }

  #[tokio::test]
  async fn stop_token_prevents_further_retries() {
    let task_unit = unit(|_: u32, _| async { Err::<u32, _>("nope") }, 5);
    task_unit.stop_token.cancel();
    let completion = task_unit.run().await;

    assert_eq!(completion.status, TaskStatus::Cancelled);
    assert_eq!(completion.retry_count, 0);
    assert_eq!(completion.error, Some(TaskError::Failed("nope")));
  }

  #[tokio::test]
  async fn abort_token_abandons_running_attempt() {
    let task_unit = unit(
      |x: u32, _| async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok::<_, ()>(x)
      },
      0,
    );
    let abort_token = task_unit.abort_token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      abort_token.cancel();
    });

    let completion = tokio::time::timeout(Duration::from_secs(2), task_unit.run())
      .await
      .expect("attempt should have been abandoned");
    assert_eq!(completion.status, TaskStatus::Cancelled);
    assert!(completion.value.is_none());
  }

  #[tokio::test]
  async fn abandoned_retry_keeps_the_previous_failure() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let task_unit = unit(
      move |_: u32, _| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
          if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(10)).await;
          }
          Err::<u32, _>("first attempt failed")
        }
      },
      3,
    );
    let abort_token = task_unit.abort_token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      abort_token.cancel();
    });

    let completion = tokio::time::timeout(Duration::from_secs(2), task_unit.run())
      .await
      .expect("retry should have been abandoned");
    assert_eq!(completion.status, TaskStatus::Cancelled);
    assert_eq!(completion.retry_count, 1);
    assert_eq!(completion.error, Some(TaskError::Failed("first attempt failed")));
  }
}
