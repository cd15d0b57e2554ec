//! Task Scheduler — DAG + indegree bookkeeping + bounded concurrency +
//! retry/timeout.
//!
//! The indegree/adjacency bookkeeping generalizes
//! `codegraph-orchestration::dag::topological_sort`'s Kahn's-algorithm shape
//! (there, over a fixed enum of pipeline stages) to arbitrary runtime
//! `TaskId`s with live indegree decrements as tasks complete, rather than a
//! single upfront topological batch order — the Scheduler here releases
//! each child the instant its last parent finishes, not in waves.
//!
//! Per spec.md §9's own design note, the completion waiter is a signaled
//! `tokio::sync::Notify`, not the 100ms poll the note calls out as a
//! simplification to improve on.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::model::{EventType, Task, TaskStatus};

pub type ExecutorResult = Result<String, String>;
pub type ExecutorFuture = Pin<Box<dyn Future<Output = ExecutorResult> + Send>>;
/// The per-task executor callback. In practice this is the Verification
/// Loop (§4.G), supplied by the Orchestrator.
pub type Executor = Arc<dyn Fn(Task) -> ExecutorFuture + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub max_concurrency: usize,
    pub default_max_attempts: u32,
    pub task_timeout_ms: u64,
    pub retry_delay_ms: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            default_max_attempts: 3,
            task_timeout_ms: 300_000,
            retry_delay_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub tasks: Vec<Task>,
    pub summary: HashMap<TaskStatus, usize>,
}

fn event_data(pairs: Vec<(&str, serde_json::Value)>) -> HashMap<String, serde_json::Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

struct Graph {
    dependents: HashMap<String, Vec<String>>,
    insertion_order: HashMap<String, usize>,
}

enum Outcome {
    Done,
    Retry,
}

/// The DAG task scheduler. Construct, call `load_plan`, optionally
/// `resume_from`, then `run`.
pub struct TaskScheduler {
    options: SchedulerOptions,
    event_bus: EventBus,
    executor: Executor,
    tasks: Mutex<HashMap<String, Task>>,
    indegree: Mutex<HashMap<String, i64>>,
    graph: Mutex<Option<Graph>>,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    remaining: AtomicUsize,
    failed_ids: Mutex<Vec<String>>,
}

impl TaskScheduler {
    pub fn new(event_bus: EventBus, executor: Executor, options: SchedulerOptions) -> Arc<Self> {
        let max_concurrency = options.max_concurrency.max(1);
        Arc::new(Self {
            options,
            event_bus,
            executor,
            tasks: Mutex::new(HashMap::new()),
            indegree: Mutex::new(HashMap::new()),
            graph: Mutex::new(None),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            notify: Notify::new(),
            remaining: AtomicUsize::new(0),
            failed_ids: Mutex::new(Vec::new()),
        })
    }

    /// Resets state, inserts every task as PENDING, builds the dependents
    /// adjacency (dropping dangling edges with a warning), and rejects
    /// cycles via three-color DFS.
    pub async fn load_plan(&self, plan_tasks: Vec<Task>) -> EngineResult<()> {
        let ids: HashSet<String> = plan_tasks.iter().map(|t| t.id.clone()).collect();

        let mut tasks = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut indegree: HashMap<String, i64> = HashMap::new();
        let mut insertion_order = HashMap::new();

        for (idx, mut task) in plan_tasks.into_iter().enumerate() {
            if task.max_attempts == 0 {
                task.max_attempts = self.options.default_max_attempts;
            }
            task.status = TaskStatus::Pending;
            task.attempts = 0;
            insertion_order.insert(task.id.clone(), idx);
            indegree.entry(task.id.clone()).or_insert(0);
            dependents.entry(task.id.clone()).or_default();

            let deps: Vec<String> = task
                .dependencies
                .iter()
                .filter(|parent| {
                    if ids.contains(*parent) {
                        true
                    } else {
                        warn!(task = %task.id, parent = %parent, "dangling dependency dropped");
                        false
                    }
                })
                .cloned()
                .collect();
            task.dependencies = deps.into_iter().collect();

            tasks.insert(task.id.clone(), task);
        }

        for task in tasks.values() {
            for parent in &task.dependencies {
                dependents.entry(parent.clone()).or_default().push(task.id.clone());
                *indegree.entry(task.id.clone()).or_insert(0) += 1;
            }
        }

        detect_cycle(&dependents)?;

        *self.tasks.lock().await = tasks;
        *self.indegree.lock().await = indegree;
        *self.graph.lock().await = Some(Graph { dependents, insertion_order });
        Ok(())
    }

    /// Marks each named task COMPLETED with the given result and decrements
    /// every child's indegree by one (clamped at zero). Call before `run`.
    pub async fn resume_from(&self, completed_ids: &[String], results: HashMap<String, String>) {
        let mut tasks = self.tasks.lock().await;
        let graph = self.graph.lock().await;
        let mut indegree = self.indegree.lock().await;

        for id in completed_ids {
            if let Some(task) = tasks.get_mut(id) {
                task.status = TaskStatus::Completed;
                task.result = results.get(id).cloned();
            }
            if let Some(graph) = graph.as_ref() {
                if let Some(children) = graph.dependents.get(id) {
                    for child in children {
                        let entry = indegree.entry(child.clone()).or_insert(0);
                        *entry = (*entry - 1).max(0);
                    }
                }
            }
        }
    }

    pub async fn get_task_result(&self, id: &str) -> Option<String> {
        self.tasks.lock().await.get(id).and_then(|t| t.result.clone())
    }

    pub async fn get_all_results(&self) -> HashMap<String, String> {
        self.tasks
            .lock()
            .await
            .values()
            .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
            .collect()
    }

    pub async fn get_status(&self) -> StatusSnapshot {
        let tasks = self.tasks.lock().await;
        let mut summary = HashMap::new();
        for task in tasks.values() {
            *summary.entry(task.status).or_insert(0) += 1;
        }
        StatusSnapshot { tasks: tasks.values().cloned().collect(), summary }
    }

    /// Runs the loaded plan to completion. Resolves once no task remains in
    /// a non-terminal state; returns `Err` if any task ended FAILED or
    /// SKIPPED.
    pub async fn run(self: &Arc<Self>) -> EngineResult<()> {
        let task_count = self.tasks.lock().await.len();
        self.event_bus
            .emit(EventType::EngineStart, event_data(vec![("taskCount", task_count.into())]))
            .await;

        let non_terminal = {
            let tasks = self.tasks.lock().await;
            tasks.values().filter(|t| !t.status.is_terminal()).count()
        };
        self.remaining.store(non_terminal, Ordering::SeqCst);

        if non_terminal == 0 {
            self.event_bus
                .emit(EventType::EngineComplete, event_data(vec![("completed", task_count.into()), ("failed", 0.into())]))
                .await;
            return Ok(());
        }

        // Every task in the plan has a non-terminal status at this point
        // (a resumed run's COMPLETED tasks were already excluded above), so
        // an empty ready set here means a genuine deadlock, not "nothing to
        // do" — belt-and-braces behind cycle detection (spec.md §7).
        let ready = self.initial_ready_set().await;
        if ready.is_empty() {
            return Err(EngineError::NoReadyTask);
        }

        for id in ready {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.schedule_task(id).await });
        }

        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }

        let failed_ids = self.failed_ids.lock().await.clone();
        if !failed_ids.is_empty() {
            return Err(EngineError::TasksFailed(failed_ids.len(), failed_ids.join(", ")));
        }

        self.event_bus
            .emit(EventType::EngineComplete, event_data(vec![("completed", task_count.into()), ("failed", 0.into())]))
            .await;
        Ok(())
    }

    async fn initial_ready_set(&self) -> Vec<String> {
        let tasks = self.tasks.lock().await;
        let indegree = self.indegree.lock().await;
        let graph = self.graph.lock().await;
        let Some(graph) = graph.as_ref() else { return Vec::new() };

        let mut ready: Vec<&Task> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && indegree.get(&t.id).copied().unwrap_or(0) <= 0)
            .collect();
        ready.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                let ia = graph.insertion_order.get(&a.id).copied().unwrap_or(usize::MAX);
                let ib = graph.insertion_order.get(&b.id).copied().unwrap_or(usize::MAX);
                ia.cmp(&ib)
            })
        });
        ready.into_iter().map(|t| t.id.clone()).collect()
    }

    /// Marks QUEUED, acquires a concurrency permit, runs one attempt. A
    /// retryable failure releases the permit and loops back to acquire a
    /// fresh one after the retry delay — a retry never bypasses the
    /// concurrency cap, and never holds two permits at once.
    async fn schedule_task(self: Arc<Self>, id: String) {
        loop {
            {
                let mut tasks = self.tasks.lock().await;
                if let Some(task) = tasks.get_mut(&id) {
                    task.status = TaskStatus::Queued;
                }
            }

            let permit = self.semaphore.clone().acquire_owned().await;
            let outcome = self.run_attempt(&id).await;
            drop(permit);

            match outcome {
                Outcome::Done => break,
                Outcome::Retry => {
                    tokio::time::sleep(Duration::from_millis(self.options.retry_delay_ms)).await;
                }
            }
        }
    }

    /// Runs a single execution attempt for `id`: RUNNING, execute-or-timeout,
    /// then the success/retry/exhausted branch. Returns `Retry` only when
    /// the caller should loop back for another attempt.
    async fn run_attempt(&self, id: &str) -> Outcome {
        let (task_snapshot, timeout_ms) = {
            let mut tasks = self.tasks.lock().await;
            let Some(task) = tasks.get_mut(id) else { return Outcome::Done };
            task.status = TaskStatus::Running;
            task.started_at = Some(chrono::Utc::now());
            task.attempts += 1;
            (task.clone(), self.options.task_timeout_ms)
        };

        self.event_bus
            .emit(
                EventType::TaskStart,
                event_data(vec![
                    ("taskId", task_snapshot.id.clone().into()),
                    ("filePath", task_snapshot.file_path.clone().into()),
                    ("attempt", task_snapshot.attempts.into()),
                ]),
            )
            .await;

        let start = std::time::Instant::now();
        let fut = (self.executor)(task_snapshot.clone());
        let outcome = tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await;

        let result = match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(message)) => Err(message),
            Err(_) => Err(format!("Task {} timed out after {}ms", task_snapshot.id, timeout_ms)),
        };

        match result {
            Ok(text) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                {
                    let mut tasks = self.tasks.lock().await;
                    if let Some(task) = tasks.get_mut(id) {
                        task.status = TaskStatus::Completed;
                        task.result = Some(text);
                        task.completed_at = Some(chrono::Utc::now());
                    }
                }
                self.event_bus
                    .emit(
                        EventType::TaskComplete,
                        event_data(vec![("taskId", id.into()), ("duration", duration_ms.into())]),
                    )
                    .await;
                self.on_terminal();
                self.on_task_completed(id).await;
                Outcome::Done
            }
            Err(message) => {
                let (attempts, max_attempts) = {
                    let tasks = self.tasks.lock().await;
                    let task = &tasks[id];
                    (task.attempts, task.max_attempts)
                };

                if attempts < max_attempts {
                    self.event_bus
                        .emit(
                            EventType::TaskRetry,
                            event_data(vec![
                                ("taskId", id.into()),
                                ("attempt", attempts.into()),
                                ("error", message.clone().into()),
                            ]),
                        )
                        .await;
                    // The retry delay and re-acquisition happen in the
                    // caller's loop, after this attempt's permit is dropped.
                    Outcome::Retry
                } else {
                    {
                        let mut tasks = self.tasks.lock().await;
                        if let Some(task) = tasks.get_mut(id) {
                            task.status = TaskStatus::Failed;
                            task.error = Some(message.clone());
                        }
                    }
                    self.failed_ids.lock().await.push(id.to_string());
                    self.event_bus
                        .emit(
                            EventType::TaskFailed,
                            event_data(vec![
                                ("taskId", id.into()),
                                ("error", message.into()),
                                ("attempts", attempts.into()),
                            ]),
                        )
                        .await;
                    self.on_terminal();
                    self.skip_dependent_tasks(id).await;
                    Outcome::Done
                }
            }
        }
    }

    fn on_terminal(&self) {
        self.remaining.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// For each child of `parent_id`, decrements indegree; if it reaches
    /// zero and the child is still PENDING, schedules it. Fire-and-forget
    /// so siblings run in parallel.
    async fn on_task_completed(self: &Arc<Self>, parent_id: &str) {
        let children = {
            let graph = self.graph.lock().await;
            graph
                .as_ref()
                .and_then(|g| g.dependents.get(parent_id).cloned())
                .unwrap_or_default()
        };

        for child in children {
            let ready_now = {
                let mut indegree = self.indegree.lock().await;
                let entry = indegree.entry(child.clone()).or_insert(0);
                *entry -= 1;
                *entry <= 0
            };
            if ready_now {
                let tasks = self.tasks.lock().await;
                let is_pending = tasks.get(&child).map(|t| t.status == TaskStatus::Pending).unwrap_or(false);
                drop(tasks);
                if is_pending {
                    let scheduler = self.clone();
                    tokio::spawn(async move { scheduler.schedule_task(child).await });
                }
            }
        }
    }

    /// BFS over dependents starting at `failed_id`; every visited
    /// descendant is marked SKIPPED.
    async fn skip_dependent_tasks(&self, failed_id: &str) {
        let dependents = {
            let graph = self.graph.lock().await;
            graph.as_ref().map(|g| g.dependents.clone()).unwrap_or_default()
        };

        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back(failed_id.to_string());

        while let Some(id) = queue.pop_front() {
            let Some(children) = dependents.get(&id) else { continue };
            for child in children {
                if !visited.insert(child.clone()) {
                    continue;
                }
                let newly_skipped = {
                    let mut tasks = self.tasks.lock().await;
                    match tasks.get_mut(child) {
                        Some(task) if !task.status.is_terminal() => {
                            task.status = TaskStatus::Skipped;
                            task.error = Some(format!("Skipped due to failed dependency: {failed_id}"));
                            true
                        }
                        _ => false,
                    }
                };
                // A descendant reachable through two failed ancestors must only be
                // counted terminal once, or `remaining` underflows.
                if newly_skipped {
                    self.failed_ids.lock().await.push(child.clone());
                    self.on_terminal();
                }
                queue.push_back(child.clone());
            }
        }
    }
}

/// Three-color DFS cycle detection over the dependents adjacency.
fn detect_cycle(dependents: &HashMap<String, Vec<String>>) -> EngineResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut colors: HashMap<&str, Color> = dependents.keys().map(|k| (k.as_str(), Color::White)).collect();

    fn visit<'a>(
        node: &'a str,
        dependents: &'a HashMap<String, Vec<String>>,
        colors: &mut HashMap<&'a str, Color>,
    ) -> bool {
        colors.insert(node, Color::Gray);
        if let Some(children) = dependents.get(node) {
            for child in children {
                match colors.get(child.as_str()).copied().unwrap_or(Color::White) {
                    Color::Gray => return true,
                    Color::White => {
                        if visit(child.as_str(), dependents, colors) {
                            return true;
                        }
                    }
                    Color::Black => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        false
    }

    let keys: Vec<&str> = dependents.keys().map(|k| k.as_str()).collect();
    for node in keys {
        if colors.get(node).copied().unwrap_or(Color::White) == Color::White {
            if visit(node, dependents, &mut colors) {
                return Err(EngineError::CyclicDependency);
            }
        }
    }
    Ok(())
}
