// Integration tests for scriptpool::thread::scheduler

mod test_helpers;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use scriptpool::thread::config::SchedulerConfig;
use scriptpool::thread::error::TaskError;
use scriptpool::thread::scheduler::{GroupSummary, MEMBER_INDEX_PARAM};
use scriptpool::thread::task::{Task, TaskPriority, TaskRef, TaskStatus};
use scriptpool_api::testing::ScriptedProvider;
use scriptpool_api::types::params;
use scriptpool_api::Params;
use test_helpers::{setup_scheduler, wait_until, WAIT_LIMIT};

fn prioritized(script: &str, priority: TaskPriority) -> Task {
    Task::new(script, Params::new()).unwrap().with_priority(priority)
}

async fn wait_all(tasks: &[TaskRef]) -> anyhow::Result<Vec<TaskStatus>> {
    let mut statuses = Vec::with_capacity(tasks.len());
    for task in tasks {
        statuses.push(tokio::time::timeout(WAIT_LIMIT, task.wait()).await?);
    }
    Ok(statuses)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_high_then_defaults_in_submission_order() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 1, None).await?;

    let tasks = vec![
        scheduler.schedule_task(prioritized("print(1+1)", TaskPriority::High)),
        scheduler.schedule_task(prioritized("print(2+2)", TaskPriority::Default)),
        scheduler.schedule_task(prioritized("print(3+3)", TaskPriority::Default)),
    ];

    assert_eq!(wait_all(&tasks).await?, vec![TaskStatus::Completed; 3]);
    assert_eq!(
        provider.evaluated_scripts(),
        vec!["print(1+1)", "print(2+2)", "print(3+3)"]
    );

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_high_priority_overtakes_earlier_defaults() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 1, None).await?;

    let blocker = scheduler.schedule_task(prioritized("hang", TaskPriority::Default));
    let tasks = vec![
        scheduler.schedule_task(prioritized("print(2+2)", TaskPriority::Default)),
        scheduler.schedule_task(prioritized("print(3+3)", TaskPriority::Default)),
        scheduler.schedule_task(prioritized("low", TaskPriority::Low)),
        scheduler.schedule_task(prioritized("print(1+1)", TaskPriority::High)),
    ];
    assert_eq!(scheduler.pending_count(), 4);

    provider.release_hung();
    wait_all(&[blocker]).await?;
    assert_eq!(wait_all(&tasks).await?, vec![TaskStatus::Completed; 4]);
    assert_eq!(
        provider.evaluated_scripts(),
        vec!["hang", "print(1+1)", "print(2+2)", "print(3+3)", "low"]
    );

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_equal_priority_is_fifo() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 1, None).await?;

    let scripts: Vec<String> = (0..20).map(|i| format!("job-{}", i)).collect();
    let tasks: Vec<TaskRef> = scripts
        .iter()
        .map(|script| scheduler.schedule_task(prioritized(script, TaskPriority::Default)))
        .collect();
    assert_eq!(wait_all(&tasks).await?, vec![TaskStatus::Completed; 20]);
    assert_eq!(provider.evaluated_scripts(), scripts);
    wait_until("registry drained", || scheduler.tracked_count() == 0).await;

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_every_task_finishes_on_a_larger_pool() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 3, None).await?;

    let tasks: Vec<TaskRef> = (0..30)
        .map(|i| {
            let priority = match i % 3 {
                0 => TaskPriority::Low,
                1 => TaskPriority::Default,
                _ => TaskPriority::High,
            };
            scheduler.schedule_task(prioritized(&format!("sleep:{}", i % 4), priority))
        })
        .collect();
    assert_eq!(wait_all(&tasks).await?, vec![TaskStatus::Completed; 30]);
    assert_eq!(provider.evaluations().len(), 30);
    assert_eq!(scheduler.pending_count(), 0);
    assert_eq!(provider.cross_thread_accesses(), 0);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_aged_low_priority_task_is_not_starved() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let config = SchedulerConfig {
        balance_interval: Duration::from_millis(10),
        promotion_bound: Some(Duration::from_millis(50)),
    };
    let scheduler = setup_scheduler(provider.clone(), 1, Some(config)).await?;

    let blocker = scheduler.schedule_task(prioritized("hang", TaskPriority::High));
    let low = scheduler.schedule_task(prioritized("low", TaskPriority::Low));
    let mut highs: Vec<TaskRef> = (0..2)
        .map(|_| scheduler.schedule_task(prioritized("sleep:10", TaskPriority::High)))
        .collect();
    provider.release_hung();

    // Keep High work waiting the whole time the Low task does.
    let deadline = Instant::now() + WAIT_LIMIT;
    while !low.is_terminal() {
        assert!(Instant::now() < deadline, "low priority task never ran");
        if scheduler.pending_count() < 4 {
            highs.push(scheduler.schedule_task(prioritized("sleep:10", TaskPriority::High)));
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(low.wait().await, TaskStatus::Completed);

    let order = provider.evaluated_scripts();
    let low_at = order.iter().position(|s| s == "low").expect("low evaluated");
    // High tasks went first until aging lifted the Low task.
    assert!(low_at >= 2, "low ran without contention: {:?}", order);
    assert!(highs.len() > low_at);

    wait_all(&[blocker]).await?;
    wait_all(&highs).await?;
    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_running_task_reports_cancelled() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 1, None).await?;

    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let (ok, err) = (outcomes.clone(), outcomes.clone());
    let task = scheduler.schedule_task(
        Task::new("hang", Params::new())?
            .on_success(move |_| ok.lock().unwrap().push("success".to_string()))
            .on_error(move |error| err.lock().unwrap().push(error.to_string())),
    );
    wait_until("script running", || provider.hung_count() == 1).await;

    assert!(scheduler.cancel_task(&task.id()));
    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert_eq!(task.error(), Some(TaskError::Cancelled));

    provider.release_hung();
    wait_until("worker idle", || scheduler.pool().idle_worker_count() == 1).await;
    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert_eq!(*outcomes.lock().unwrap(), vec![TaskError::Cancelled.to_string()]);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_group_fans_out_with_member_index() -> anyhow::Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    let scheduler = setup_scheduler(provider.clone(), 3, None).await?;

    let results = Arc::new(Mutex::new(Vec::new()));
    let summary = Arc::new(Mutex::new(None));
    let (r, s) = (results.clone(), summary.clone());
    let group = scheduler.schedule_group(
        &format!("param:{}", MEMBER_INDEX_PARAM),
        &params([("job", json!("fan-out"))]),
        4,
        TaskPriority::Default,
        move |index, value| r.lock().unwrap().push((index, value)),
        move |done| *s.lock().unwrap() = Some(done),
    )?;
    assert_eq!(group.len(), 4);

    let expected = GroupSummary { completed: 4, failed: 0, cancelled: 0 };
    assert_eq!(tokio::time::timeout(WAIT_LIMIT, group.wait()).await?, expected);
    wait_until("group completion hook", || summary.lock().unwrap().is_some()).await;
    assert_eq!(*summary.lock().unwrap(), Some(expected));

    let mut results = results.lock().unwrap().clone();
    results.sort_by_key(|(index, _)| *index);
    let expected: Vec<_> = (0..4).map(|i| (i, json!(i))).collect();
    assert_eq!(results, expected);

    assert!(matches!(
        scheduler.schedule_group("x", &Params::new(), 0, TaskPriority::Low, |_, _| {}, |_| {}),
        Err(TaskError::InvalidArgument(_))
    ));

    scheduler.shutdown().await?;
    Ok(())
}
