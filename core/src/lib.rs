//! `devforge_core` — the DAG Task Scheduler, Verification/Self-Heal Loop,
//! and Checkpoint/Resume State Machine that drive an LLM goal-to-codebase
//! run, plus the Environment Ports, Error Classifier, Interface Digest,
//! State Store, and Event Bus they're built on.
//!
//! [`Engine`] is the library surface: construct one with a `Fs`, `Shell`,
//! and `ModelProvider` adapter and an [`EngineConfig`], then call `run` or
//! `execute`.

pub mod classifier;
pub mod config;
pub mod digest;
pub mod error;
pub mod events;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod scheduler;
pub mod store;
pub mod verification;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

use events::EventBus;
use model::{ExecutionState, Phase, TaskStatus};
use orchestrator::Orchestrator;
use ports::{Fs, ModelProvider, Shell};

/// Input to [`Engine::execute`] and [`Engine::validate`].
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    pub goal: String,
    pub repo_path: Option<String>,
    pub resume: bool,
}

/// The outcome of one [`Engine::execute`] call.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub artifacts: Option<Vec<String>>,
    pub error: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

/// A rough pre-flight estimate; there is no materialized Plan yet, so this
/// is a heuristic over the goal text, not a measurement.
#[derive(Debug, Clone, Copy)]
pub struct CostEstimate {
    pub tokens: u64,
    pub cost: f64,
}

/// Cost per token used by [`Engine::estimate_cost`]'s heuristic, in the
/// same units as `CostEstimate::cost`. Deliberately coarse: a real number
/// belongs to the concrete Model adapter, which this core never depends on.
const ASSUMED_COST_PER_TOKEN: f64 = 0.000_002;

/// A point-in-time read of the last run's task status counts.
#[derive(Debug, Clone)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub summary: HashMap<TaskStatus, usize>,
}

/// The embeddable entry point: wires the Environment Ports into an
/// [`Orchestrator`] and exposes the surface spec.md §6 calls the "library
/// surface" — `run`, `execute`, `validate`, `estimate_cost`, plus read-only
/// accessors to the Event Bus and a progress snapshot.
pub struct Engine {
    fs: Arc<dyn Fs>,
    orchestrator: Orchestrator,
    last_state: Mutex<Option<ExecutionState>>,
}

impl Engine {
    pub fn new(fs: Arc<dyn Fs>, shell: Arc<dyn Shell>, model: Arc<dyn ModelProvider>, config: EngineConfig) -> Self {
        let orchestrator = Orchestrator::new(fs.clone(), shell, model, config);
        Self { fs, orchestrator, last_state: Mutex::new(None) }
    }

    pub fn event_bus(&self) -> &EventBus {
        self.orchestrator.event_bus()
    }

    pub async fn progress(&self) -> Option<ProgressSnapshot> {
        let state = self.last_state.lock().await;
        state.as_ref().map(|s| {
            let mut summary = HashMap::new();
            for task in &s.tasks {
                *summary.entry(task.status).or_insert(0) += 1;
            }
            ProgressSnapshot { phase: s.phase, summary }
        })
    }

    /// Runs `goal` to completion (or resumes it), per `orchestrator::run`.
    pub async fn run(&self, goal: &str, repo_path: Option<&str>, resume: bool) -> EngineResult<ExecutionState> {
        let result = self.orchestrator.run(goal, repo_path, resume).await;
        if let Ok(state) = &result {
            *self.last_state.lock().await = Some(state.clone());
        }
        result
    }

    /// Runs a goal and reshapes the result into the generic success/output
    /// envelope spec.md §6 names, rather than the raw `ExecutionState`.
    pub async fn execute(&self, ctx: ExecuteContext) -> ExecuteOutcome {
        match self.run(&ctx.goal, ctx.repo_path.as_deref(), ctx.resume).await {
            Ok(state) => {
                let artifacts: Vec<String> = state.tasks.iter().map(|t| t.file_path.clone()).collect();
                let mut metadata = HashMap::new();
                metadata.insert("planId".to_string(), state.plan_id.clone().into());
                metadata.insert("phase".to_string(), format!("{:?}", state.phase).to_lowercase().into());
                ExecuteOutcome {
                    success: state.phase == Phase::Completed,
                    output: Some(state.architecture_reasoning.clone()),
                    artifacts: Some(artifacts),
                    error: None,
                    metadata: Some(metadata),
                }
            }
            Err(e) => ExecuteOutcome {
                success: false,
                output: None,
                artifacts: None,
                error: Some(e.to_string()),
                metadata: None,
            },
        }
    }

    /// Cheap, pre-execution checks: an empty goal, or a `repo_path` that
    /// doesn't exist. Does not call the model — that's `execute`'s job.
    pub async fn validate(&self, ctx: &ExecuteContext) -> Vec<String> {
        let mut errors = Vec::new();
        if ctx.goal.trim().is_empty() {
            errors.push("goal must not be empty".to_string());
        }
        if let Some(repo_path) = &ctx.repo_path {
            if !self.fs.exists(repo_path).await {
                errors.push(format!("repo_path `{repo_path}` does not exist"));
            }
        }
        errors
    }

    /// A coarse, pre-plan token/cost estimate: roughly 4 characters per
    /// token for the goal text itself, plus a fixed per-task planning/
    /// verification overhead budgeted at `default_max_attempts` rounds of
    /// context the size of the goal. This is a planning aid, not a quote.
    pub fn estimate_cost(&self, ctx: &ExecuteContext) -> CostEstimate {
        let goal_tokens = (ctx.goal.len() as u64 / 4).max(1);
        let overhead_rounds = 3u64;
        let tokens = goal_tokens * (1 + overhead_rounds);
        let cost = tokens as f64 * ASSUMED_COST_PER_TOKEN;
        CostEstimate { tokens, cost }
    }
}
