use run_in_task_pool::{RunOptions, ShutdownMode, TaskCompletionStatus, TaskPool};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::info;

async fn fetch_page(page: u32, index: usize) -> Result<String, String> {
  info!("Fetching page {} (task {})", page, index);
  tokio::time::sleep(Duration::from_millis(200)).await;
  if page == 13 {
    return Err(format!("page {} is cursed", page));
  }
  Ok(format!("contents of page {}", page))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Usage Example (Limit: 3, Retries: 2) ---");

  let pool = TaskPool::new(RunOptions::new(3, 2), Handle::current(), "basic_pool");
  pool.on_completion(|completion| {
    if completion.status != TaskCompletionStatus::Succeeded {
      info!(
        "Task {} of run {} ended as {:?} after {} retries",
        completion.task_index, completion.run_id, completion.status, completion.retry_count
      );
    }
  });

  let pages: Vec<u32> = (10..18).collect();
  match pool.run(pages, fetch_page).await {
    Ok(result) => {
      info!("Partial error: {:?}", result.has_partial_error);
      for (index, outcome) in result.results.iter().enumerate() {
        match (&outcome.value, &outcome.error) {
          (Some(value), _) => info!("#{}: {} (retries: {})", index, value, outcome.retry_count),
          (None, Some(error)) => info!("#{}: failed: {}", index, error),
          (None, None) => info!("#{}: {:?}", index, outcome.status),
        }
      }
    }
    Err(e) => tracing::error!("Run could not start: {}", e),
  }

  pool
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Pool shutdown failed");
  info!("--- Basic Usage Example End ---");
}
