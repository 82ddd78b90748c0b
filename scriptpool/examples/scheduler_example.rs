use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;

use scriptpool::logging;
use scriptpool::thread::bridge::Message;
use scriptpool::thread::context::ContextScope;
use scriptpool::thread::worker::WorkerId;
use scriptpool::{SchedulerConfig, Task, TaskPriority, TaskScheduler, ThreadPool, ThreadPoolConfig};
use scriptpool_api::testing::ScriptedProvider;
use scriptpool_api::types::params;
use scriptpool_api::{ApiTable, Params};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    logging::init_development();

    // Host functions every context sees as globals.
    let api = ApiTable::new().with_function("sum", |args| {
        let total: i64 = args[0]
            .as_object()
            .map(|object| object.values().filter_map(|v| v.as_i64()).sum())
            .unwrap_or(0);
        Ok(json!(total))
    });

    let provider = Arc::new(ScriptedProvider::new());
    let pool = ThreadPool::new(
        provider.clone(),
        api,
        Some(ThreadPoolConfig {
            initial_size: 2,
            default_task_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        }),
        Handle::current(),
    )?;
    let scheduler = TaskScheduler::new(pool.clone(), Some(SchedulerConfig::default()), Handle::current())?;

    let urgent = scheduler.schedule_task(
        Task::new("call:sum", params([("a", json!(2)), ("b", json!(40))]))?
            .with_priority(TaskPriority::High)
            .on_success(|value| println!("sum -> {}", value)),
    );
    let slow = scheduler.schedule_task(
        Task::new("hang", Params::new())?
            .with_timeout(Duration::from_millis(100))
            .on_error(|error| println!("hung task -> {}", error)),
    );

    let group = scheduler.schedule_group(
        "param:workerId",
        &Params::new(),
        4,
        TaskPriority::Default,
        |index, value| println!("member {} -> {}", index, value),
        |summary| println!("group done: {:?}", summary),
    )?;

    pool.worker(WorkerId(1))
        .ok_or("worker 1 missing")?
        .bridge()
        .register_message_handler("greet", |message: &Message, scope: &mut ContextScope<'_>| {
            println!("worker {} got {}", scope.worker_id(), message.payload);
        });
    pool.post_message(WorkerId(1), Message::new("greet", json!("hello")))?;

    urgent.wait().await;
    slow.wait().await;
    let summary = group.wait().await;
    println!("urgent: {}, slow: {}, group: {:?}", urgent.status(), slow.status(), summary);
    println!("pool: {:?}", pool.metrics());

    provider.release_hung();
    scheduler.shutdown().await?;
    Ok(())
}
