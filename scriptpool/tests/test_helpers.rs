#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Handle;

use scriptpool::thread::config::{SchedulerConfig, ThreadPoolConfig};
use scriptpool::thread::pool::ThreadPool;
use scriptpool::thread::scheduler::TaskScheduler;
use scriptpool_api::testing::ScriptedProvider;
use scriptpool_api::ApiTable;

/// Upper bound for anything a test waits on.
pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

pub fn pool_config(size: usize) -> ThreadPoolConfig {
    ThreadPoolConfig {
        initial_size: size,
        max_size: 8,
        default_task_timeout: None,
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Builds a pool over `provider` and waits for every worker to go idle.
pub async fn setup_pool(
    provider: Arc<ScriptedProvider>,
    api: ApiTable,
    size: usize,
) -> anyhow::Result<ThreadPool> {
    let pool = ThreadPool::new(provider, api, Some(pool_config(size)), Handle::current())?;
    wait_until("workers idle", || pool.idle_worker_count() == size).await;
    Ok(pool)
}

/// Scheduler in front of a fresh pool. Aging is off unless `config` turns it on.
pub async fn setup_scheduler(
    provider: Arc<ScriptedProvider>,
    size: usize,
    config: Option<SchedulerConfig>,
) -> anyhow::Result<TaskScheduler> {
    let pool = setup_pool(provider, ApiTable::new(), size).await?;
    let config = config.unwrap_or(SchedulerConfig {
        promotion_bound: None,
        ..Default::default()
    });
    Ok(TaskScheduler::new(pool, Some(config), Handle::current())?)
}

/// Polls `condition` until it holds, failing the test after `WAIT_LIMIT`.
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
