//! Integration tests for the DAG Task Scheduler: invariants 1-4 and
//! scenarios S1-S6 (see `SPEC_FULL.md` §8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devforge_core::error::EngineError;
use devforge_core::events::EventBus;
use devforge_core::model::{Task, TaskStatus, TaskType};
use devforge_core::scheduler::{Executor, SchedulerOptions, TaskScheduler};
use tokio::sync::Mutex;

fn task(id: &str, deps: &[&str]) -> Task {
    Task::new(
        id,
        format!("{id}.ts"),
        format!("task {id}"),
        TaskType::Code,
        deps.iter().map(|d| d.to_string()).collect(),
        0,
        3,
    )
}

#[tokio::test]
async fn s1_diamond_dag_respects_dependency_order() {
    let bus = EventBus::new(100);
    let order = Arc::new(Mutex::new(Vec::new()));
    let order_clone = order.clone();
    let executor: Executor = Arc::new(move |task: Task| {
        let order_clone = order_clone.clone();
        Box::pin(async move {
            order_clone.lock().await.push(task.id.clone());
            Ok(format!("result-{}", task.id))
        })
    });
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions { max_concurrency: 2, ..Default::default() });
    scheduler
        .load_plan(vec![task("a", &[]), task("b", &["a"]), task("c", &["a"]), task("d", &["b", "c"])])
        .await
        .unwrap();
    scheduler.run().await.unwrap();

    let order = order.lock().await.clone();
    let idx = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(idx("a") < idx("b"));
    assert!(idx("a") < idx("c"));
    assert!(idx("d") > idx("b"));
    assert!(idx("d") > idx("c"));
    // Invariant 4: child starts strictly after parent returns successfully.
    assert_eq!(scheduler.get_task_result("d").await, Some("result-d".to_string()));
}

#[tokio::test]
async fn s2_cycle_is_rejected_before_any_executor_runs() {
    // Invariant 2.
    let bus = EventBus::new(100);
    let calls = Arc::new(AtomicI32::new(0));
    let calls_clone = calls.clone();
    let executor: Executor = Arc::new(move |task: Task| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(format!("result-{}", task.id)) })
    });
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions::default());
    let err = scheduler.load_plan(vec![task("x", &["y"]), task("y", &["x"])]).await;
    assert!(matches!(err, Err(EngineError::CyclicDependency)));
    let message = err.unwrap_err().to_string();
    assert!(message.to_lowercase().contains("circular") || message.to_lowercase().contains("cyclic"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn s3_retry_then_succeed() {
    // Invariant 1: at most maxAttempts invocations.
    let bus = EventBus::new(100);
    let attempt = Arc::new(AtomicI32::new(0));
    let attempt_clone = attempt.clone();
    let executor: Executor = Arc::new(move |_task: Task| {
        let n = attempt_clone.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { if n < 3 { Err("boom".to_string()) } else { Ok("ok".to_string()) } })
    });
    let scheduler = TaskScheduler::new(
        bus.clone(),
        executor,
        SchedulerOptions { default_max_attempts: 3, retry_delay_ms: 1, ..Default::default() },
    );
    scheduler.load_plan(vec![task("only", &[])]).await.unwrap();
    scheduler.run().await.unwrap();
    assert_eq!(attempt.load(Ordering::SeqCst), 3);

    let retries = bus.get_history(Some(devforge_core::model::EventType::TaskRetry)).await;
    assert_eq!(retries.len(), 2);
}

#[tokio::test]
async fn s4_cascading_skip() {
    let bus = EventBus::new(100);
    let executor: Executor = Arc::new(|task: Task| {
        Box::pin(async move { if task.id == "p" { Err("always fails".to_string()) } else { Ok(format!("result-{}", task.id)) } })
    });
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions { default_max_attempts: 1, ..Default::default() });
    scheduler.load_plan(vec![task("p", &[]), task("c", &["p"]), task("g", &["c"])]).await.unwrap();
    let err = scheduler.run().await;
    assert!(err.is_err());
    let status = scheduler.get_status().await;
    assert_eq!(status.summary.get(&TaskStatus::Failed).copied().unwrap_or(0), 1);
    assert_eq!(status.summary.get(&TaskStatus::Skipped).copied().unwrap_or(0), 2);
    assert_eq!(status.summary.get(&TaskStatus::Completed).copied().unwrap_or(0), 0);
    let c = status.tasks.iter().find(|t| t.id == "c").unwrap();
    assert!(c.error.as_ref().unwrap().contains("Skipped due to failed dependency: p"));
}

#[tokio::test]
async fn s5_concurrency_cap_is_honored() {
    // Invariant 3.
    let bus = EventBus::new(100);
    let current = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let current_clone = current.clone();
    let max_clone = max_observed.clone();
    let executor: Executor = Arc::new(move |task: Task| {
        let current_clone = current_clone.clone();
        let max_clone = max_clone.clone();
        Box::pin(async move {
            let now = current_clone.fetch_add(1, Ordering::SeqCst) + 1;
            max_clone.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            current_clone.fetch_sub(1, Ordering::SeqCst);
            Ok(format!("result-{}", task.id))
        })
    });
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions { max_concurrency: 2, ..Default::default() });
    scheduler
        .load_plan(vec![task("1", &[]), task("2", &[]), task("3", &[]), task("4", &[]), task("5", &[])])
        .await
        .unwrap();
    scheduler.run().await.unwrap();
    assert!(max_observed.load(Ordering::SeqCst) <= 2);
    let status = scheduler.get_status().await;
    assert_eq!(status.summary.get(&TaskStatus::Completed).copied().unwrap_or(0), 5);
}

#[tokio::test]
async fn s6_resume_only_invokes_pending_tasks() {
    let bus = EventBus::new(100);
    let invoked = Arc::new(Mutex::new(Vec::new()));
    let invoked_clone = invoked.clone();
    let executor: Executor = Arc::new(move |task: Task| {
        let invoked_clone = invoked_clone.clone();
        Box::pin(async move {
            invoked_clone.lock().await.push(task.id.clone());
            Ok(format!("from-{}", task.id))
        })
    });
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions::default());
    scheduler.load_plan(vec![task("a", &[]), task("b", &["a"])]).await.unwrap();
    let mut results = HashMap::new();
    results.insert("a".to_string(), "A".to_string());
    scheduler.resume_from(&["a".to_string()], results).await;
    scheduler.run().await.unwrap();
    assert_eq!(*invoked.lock().await, vec!["b".to_string()]);
    assert_eq!(scheduler.get_task_result("a").await, Some("A".to_string()));
}

#[tokio::test]
async fn dangling_dependency_is_dropped_not_blocking() {
    let bus = EventBus::new(100);
    let executor: Executor = Arc::new(|task: Task| Box::pin(async move { Ok(format!("result-{}", task.id)) }));
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions::default());
    scheduler.load_plan(vec![task("a", &["ghost"])]).await.unwrap();
    scheduler.run().await.unwrap();
    assert_eq!(scheduler.get_task_result("a").await, Some("result-a".to_string()));
}

#[tokio::test]
async fn resuming_a_fully_completed_plan_does_not_error() {
    let bus = EventBus::new(100);
    let executor: Executor = Arc::new(|task: Task| Box::pin(async move { Ok(format!("result-{}", task.id)) }));
    let scheduler = TaskScheduler::new(bus, executor, SchedulerOptions::default());
    scheduler.load_plan(vec![task("a", &[])]).await.unwrap();
    let mut results = HashMap::new();
    results.insert("a".to_string(), "done".to_string());
    scheduler.resume_from(&["a".to_string()], results).await;
    scheduler.run().await.unwrap();
    assert_eq!(scheduler.get_task_result("a").await, Some("done".to_string()));
}
