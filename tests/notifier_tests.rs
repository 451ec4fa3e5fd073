use run_in_task_pool::{RunOptions, ShutdownMode, TaskCompletionInfo, TaskCompletionStatus, TaskPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle as TokioHandle;
use tokio::time::sleep;

// Helper to initialize tracing for tests
fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter =
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,run_in_task_pool=trace"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .finish()
      .try_init()
      .ok();
  });
}

// Polls until `expected` events were collected or the deadline passes.
async fn wait_for_events(events: &Arc<Mutex<Vec<TaskCompletionInfo>>>, expected: usize) -> Vec<TaskCompletionInfo> {
  for _ in 0..100 {
    if events.lock().unwrap().len() >= expected {
      break;
    }
    sleep(Duration::from_millis(10)).await;
  }
  let mut collected = events.lock().unwrap().clone();
  collected.sort_by_key(|info| info.task_index);
  collected
}

#[tokio::test]
async fn test_handler_receives_one_event_per_terminal_task() {
  setup_tracing_for_test();
  let pool = TaskPool::new(RunOptions::default(), TokioHandle::current(), "notifier_pool_basic");
  let events = Arc::new(Mutex::new(Vec::new()));

  let sink = events.clone();
  pool.on_completion(move |info| sink.lock().unwrap().push(info));

  let result = pool
    .run_with_options(
      vec![1u32, 2, 3],
      |x: u32, _| async move { if x == 2 { Err("two fails") } else { Ok(x) } },
      RunOptions::new(2, 1),
    )
    .await
    .unwrap();
  assert_eq!(result.has_partial_error, Some(true));

  let collected = wait_for_events(&events, 3).await;
  assert_eq!(collected.len(), 3);
  assert_eq!(collected[0].status, TaskCompletionStatus::Succeeded);
  assert_eq!(collected[1].status, TaskCompletionStatus::PermanentlyFailed);
  assert_eq!(collected[1].retry_count, 1);
  assert_eq!(collected[2].status, TaskCompletionStatus::Succeeded);
  assert!(collected.iter().all(|info| info.pool_name.as_str() == "notifier_pool_basic"));

  let run_id = collected[0].run_id;
  assert!(collected.iter().all(|info| info.run_id == run_id));

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_cancelled_tasks_are_reported() {
  setup_tracing_for_test();
  let pool = TaskPool::new(RunOptions::default(), TokioHandle::current(), "notifier_pool_cancel");
  let events = Arc::new(Mutex::new(Vec::new()));

  let sink = events.clone();
  pool.on_completion(move |info| sink.lock().unwrap().push(info));

  let mut handle = pool
    .spawn_run(
      vec![1u32, 2, 3],
      |x: u32, _| async move {
        sleep(Duration::from_millis(60)).await;
        Ok::<_, ()>(x)
      },
      RunOptions::new(1, 0),
    )
    .unwrap();

  sleep(Duration::from_millis(20)).await;
  handle.cancel(ShutdownMode::Graceful);
  handle.await_result().await.unwrap();

  let collected = wait_for_events(&events, 3).await;
  let statuses: Vec<TaskCompletionStatus> = collected.iter().map(|info| info.status).collect();
  assert_eq!(
    statuses,
    vec![
      TaskCompletionStatus::Succeeded,
      TaskCompletionStatus::Cancelled,
      TaskCompletionStatus::Cancelled
    ]
  );

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_panicking_handler_does_not_affect_other_handlers_or_the_run() {
  setup_tracing_for_test();
  let pool = TaskPool::new(RunOptions::default(), TokioHandle::current(), "notifier_pool_handler_panic");
  let delivered = Arc::new(AtomicUsize::new(0));

  pool.on_completion(|info| {
    if info.task_index == 0 {
      panic!("handler intentionally panicked");
    }
  });
  let counter = delivered.clone();
  pool.on_completion(move |_| {
    counter.fetch_add(1, Ordering::SeqCst);
  });

  let result = pool
    .run(vec![1u32, 2], |x: u32, _| async move { Ok::<_, ()>(x) })
    .await
    .unwrap();
  assert_eq!(result.has_partial_error, Some(false));

  for _ in 0..100 {
    if delivered.load(Ordering::SeqCst) >= 2 {
      break;
    }
    sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(delivered.load(Ordering::SeqCst), 2);

  pool.shutdown(ShutdownMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_events_are_not_queued_without_handlers() {
  setup_tracing_for_test();
  let pool = TaskPool::new(RunOptions::default(), TokioHandle::current(), "notifier_pool_no_handlers");

  pool
    .run(vec![1u32, 2, 3], |x: u32, _| async move { Ok::<_, ()>(x) })
    .await
    .unwrap();

  // A handler registered after the run sees nothing from it.
  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = events.clone();
  pool.on_completion(move |info: TaskCompletionInfo| sink.lock().unwrap().push(info));
  sleep(Duration::from_millis(50)).await;
  assert!(events.lock().unwrap().is_empty());

  pool
    .run(vec![4u32], |x: u32, _| async move { Ok::<_, ()>(x) })
    .await
    .unwrap();
  let collected = wait_for_events(&events, 1).await;
  assert_eq!(collected.len(), 1);
  assert_eq!(collected[0].task_index, 0);

  tokio::time::timeout(Duration::from_secs(2), pool.shutdown(ShutdownMode::Graceful))
    .await
    .expect("notifier worker should stop once all senders are gone")
    .unwrap();
}
