//! Orchestrator — the phase state machine that owns a run end to end:
//! gather context, plan, execute, document.
//!
//! The phase enum itself lives on `model::Phase`; what this module adds is
//! the legality guard and the run/resume entry point. Grounded in the
//! teacher's `state_machine::{OrchestratorState, is_legal_transition,
//! TransitionRecord}` shape (an explicit enum, a pure transition-legality
//! predicate, a logged transition history) — scaled down from that file's
//! nine-state loop to spec.md's four live phases plus the absorbing
//! `failed` state reachable from any non-terminal one. The teacher's
//! separate `StateBudget`/`BudgetTracker` (per-state wall-clock budgets)
//! and `StateCheckpoint`/`save_checkpoint`/`load_checkpoint` subsystems are
//! not carried over: budgets have no counterpart in this contract, and
//! checkpointing is already [`crate::store::StateStore`]'s job end to end
//! (see `DESIGN.md`).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::warn;

use crate::digest::{self, DigestOptions};
use crate::error::{EngineError, EngineResult};
use crate::events::EventBus;
use crate::model::{EngineEvent, EventType, ExecutionState, Phase, Task, TaskStatus, TaskType};
use crate::ports::{Fs, GenerateRequest, ListOptions, ModelProvider, Shell};
use crate::scheduler::{SchedulerOptions, TaskScheduler};
use crate::store::{self, StateStore, StoreError};
use crate::verification::{self, VerificationContext, VerificationOptions};

const MAX_CONTEXT_FILES: usize = 200;

/// A single recorded phase change, kept in memory for diagnostics; the
/// durable record of "where are we" is `ExecutionState::phase` itself,
/// checkpointed on every transition.
#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Whether `to` is a legal next phase from `from`. Any non-terminal phase
/// may transition to `Failed`; otherwise the run only moves forward along
/// `planning -> executing -> documenting -> completed`.
pub fn is_legal_transition(from: Phase, to: Phase) -> bool {
    if to == Phase::Failed {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Phase::Planning, Phase::Executing)
            | (Phase::Executing, Phase::Documenting)
            | (Phase::Documenting, Phase::Completed)
    )
}

fn event_data(pairs: Vec<(&str, serde_json::Value)>) -> HashMap<String, serde_json::Value> {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Planning => "planning",
        Phase::Executing => "executing",
        Phase::Documenting => "documenting",
        Phase::Completed => "completed",
        Phase::Failed => "failed",
    }
}

fn store_err(e: StoreError) -> EngineError {
    EngineError::Io(std::io::Error::other(e))
}

#[derive(Debug, Deserialize)]
struct ArchitectTaskDescriptor {
    id: String,
    #[serde(rename = "filePath")]
    file_path: String,
    description: String,
    #[serde(rename = "type")]
    task_type: TaskType,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Deserialize)]
struct ArchitectResponse {
    tasks: Vec<ArchitectTaskDescriptor>,
    #[serde(default)]
    reasoning: String,
}

fn architect_prompt(goal: &str, context: &str) -> GenerateRequest {
    let prompt = format!(
        "# Goal\n{goal}\n\n## Existing Codebase Context\n{context}\n\nDecompose this goal into a dependency-ordered list of file-producing tasks. Respond with only JSON of the shape {{\"tasks\": [{{\"id\": string, \"filePath\": string, \"description\": string, \"type\": \"code\"|\"test\"|\"config\"|\"docs\", \"dependencies\": string[], \"priority\": number}}], \"reasoning\": string}}, no prose, no Markdown code fences."
    );
    GenerateRequest::new(
        "You are a software architect decomposing a goal into an executable task DAG.",
        prompt,
    )
    .json()
}

fn scribe_prompt(goal: &str, tasks: &[Task], reasoning: &str) -> GenerateRequest {
    let mut listing = String::new();
    for task in tasks {
        listing.push_str(&format!("- `{}` ({:?}): {}\n", task.file_path, task.status, task.description));
    }
    let prompt = format!(
        "# Goal\n{goal}\n\n## Architecture Reasoning\n{reasoning}\n\n## Produced Files\n{listing}\nWrite a README documenting what was built and how to use it. Respond with only the README's Markdown source, no prose, no Markdown code fences wrapping the whole document.\n"
    );
    GenerateRequest::new(
        "You are a technical writer documenting a freshly built project.",
        prompt,
    )
}

/// Wires the Environment Ports, the State Store, the Event Bus, the
/// Scheduler, and the Verification Loop into a single `run` entry point.
pub struct Orchestrator {
    fs: Arc<dyn Fs>,
    shell: Arc<dyn Shell>,
    model: Arc<dyn ModelProvider>,
    store: StateStore,
    event_bus: EventBus,
    config: crate::config::EngineConfig,
    transitions: Mutex<Vec<TransitionRecord>>,
}

impl Orchestrator {
    pub fn new(
        fs: Arc<dyn Fs>,
        shell: Arc<dyn Shell>,
        model: Arc<dyn ModelProvider>,
        config: crate::config::EngineConfig,
    ) -> Self {
        let event_bus = EventBus::new(config.max_history_size);
        let store = StateStore::new(config.state_dir.clone());
        Self { fs, shell, model, store, event_bus, config, transitions: Mutex::new(Vec::new()) }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    async fn checkpoint(&self, state: &ExecutionState) -> EngineResult<()> {
        self.store.save(state).await.map_err(store_err)?;
        self.event_bus
            .emit(EventType::CheckpointSaved, event_data(vec![("planId", state.plan_id.clone().into())]))
            .await;
        Ok(())
    }

    /// Validates the transition, emits `phase:complete`/`phase:start`,
    /// mutates `state.phase`, records it, then checkpoints.
    async fn transition(&self, state: &mut ExecutionState, to: Phase) -> EngineResult<()> {
        let from = state.phase;
        if !is_legal_transition(from, to) {
            return Err(EngineError::PlanInvalid(format!(
                "illegal phase transition {} -> {}",
                phase_label(from),
                phase_label(to)
            )));
        }
        self.event_bus
            .emit(EventType::PhaseComplete, event_data(vec![("phase", phase_label(from).into())]))
            .await;
        state.phase = to;
        self.transitions.lock().await.push(TransitionRecord { from, to, at: chrono::Utc::now() });
        self.event_bus
            .emit(EventType::PhaseStart, event_data(vec![("phase", phase_label(to).into())]))
            .await;
        self.checkpoint(state).await
    }

    async fn fail(&self, state: &mut ExecutionState, error: &EngineError) {
        if !state.phase.is_terminal() {
            state.phase = Phase::Failed;
        }
        self.event_bus
            .emit(EventType::EngineError, event_data(vec![("message", error.to_string().into())]))
            .await;
        if let Err(e) = self.checkpoint(state).await {
            warn!(error = %e, "checkpoint save failed while recording a fatal error");
        }
    }

    async fn load_or_create_state(&self, goal: &str, resume: bool) -> EngineResult<ExecutionState> {
        if resume {
            if let Some(existing) = self.store.find_latest_for_goal(goal).await.map_err(store_err)? {
                if !store::is_complete(&existing) {
                    self.event_bus
                        .emit(
                            EventType::CheckpointRestored,
                            event_data(vec![("planId", existing.plan_id.clone().into())]),
                        )
                        .await;
                    return Ok(existing);
                }
            }
        }
        let plan_id = store::make_plan_id(goal, chrono::Utc::now().timestamp_millis());
        let state = ExecutionState::new(plan_id, goal);
        self.checkpoint(&state).await?;
        Ok(state)
    }

    /// Best-effort: lists and digests up to `MAX_CONTEXT_FILES` files under
    /// `repo_path`. Any read/list failure is swallowed; a repo that can't be
    /// inspected just means planning proceeds with no prior-art context.
    async fn gather_context(&self, repo_path: Option<&str>) -> String {
        let Some(repo_path) = repo_path else {
            return "No existing codebase found".to_string();
        };

        let listed = self
            .fs
            .list(repo_path, ListOptions { recursive: true, max_depth: Some(8), ..Default::default() })
            .await;
        let Ok(paths) = listed else {
            return "No existing codebase found".to_string();
        };

        let mut sections = Vec::new();
        for rel in paths.into_iter().take(MAX_CONTEXT_FILES) {
            let full_path = format!("{repo_path}/{rel}");
            let Ok(bytes) = self.fs.read(&full_path).await else { continue };
            let source = String::from_utf8_lossy(&bytes);
            let digested = digest::digest(&rel, &source, &DigestOptions::default());
            if !digested.is_empty() {
                sections.push(format!("### {rel}\n{digested}"));
            }
        }

        if sections.is_empty() {
            "No existing codebase found".to_string()
        } else {
            sections.join("\n\n")
        }
    }

    async fn run_planning(&self, state: &mut ExecutionState, goal: &str, context: &str) -> EngineResult<()> {
        self.event_bus.emit(EventType::PhaseStart, event_data(vec![("phase", "planning".into())])).await;

        let raw = self
            .model
            .generate(architect_prompt(goal, context))
            .await
            .map_err(|e| EngineError::ModelApiFailure(e.to_string()))?;
        let stripped = verification::strip_code_fence(&raw);

        let parsed: ArchitectResponse = serde_json::from_str(&stripped).map_err(|e| {
            let prefix: String = raw.chars().take(200).collect();
            EngineError::PlanInvalid(format!(
                "failed to parse planning response as JSON: {e}; raw response (first 200 chars): {prefix}"
            ))
        })?;

        if parsed.tasks.is_empty() {
            return Err(EngineError::PlanInvalid("planning response contained no tasks".to_string()));
        }

        state.architecture_reasoning = parsed.reasoning;
        state.tasks = parsed
            .tasks
            .into_iter()
            .map(|t| {
                Task::new(
                    t.id,
                    t.file_path,
                    t.description,
                    t.task_type,
                    t.dependencies.into_iter().collect(),
                    t.priority,
                    self.config.default_max_attempts,
                )
            })
            .collect();

        self.transition(state, Phase::Executing).await
    }

    async fn run_execution(&self, state: &mut ExecutionState) -> EngineResult<()> {
        let completed_ids: Vec<String> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        let seed_results: HashMap<String, String> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.result.clone().map(|r| (t.id.clone(), r)))
            .collect();
        let results = Arc::new(Mutex::new(seed_results.clone()));

        let verification_ctx = Arc::new(VerificationContext {
            fs: self.fs.clone(),
            shell: self.shell.clone(),
            model: self.model.clone(),
            options: VerificationOptions {
                max_retries: self.config.verification_max_retries,
                task_timeout_ms: self.config.task_timeout_ms,
            },
        });
        let executor = verification::build_executor(verification_ctx, results.clone());

        let scheduler = TaskScheduler::new(
            self.event_bus.clone(),
            executor,
            SchedulerOptions {
                max_concurrency: self.config.max_concurrency,
                default_max_attempts: self.config.default_max_attempts,
                task_timeout_ms: self.config.task_timeout_ms,
                retry_delay_ms: self.config.retry_delay_ms,
            },
        );
        scheduler.load_plan(state.tasks.clone()).await?;
        if !completed_ids.is_empty() {
            scheduler.resume_from(&completed_ids, seed_results).await;
        }

        let checkpoint_handler = {
            let store = self.store.clone();
            let scheduler = scheduler.clone();
            let results = results.clone();
            let plan_id = state.plan_id.clone();
            let goal = state.goal.clone();
            let architecture_reasoning = state.architecture_reasoning.clone();
            move |_event: EngineEvent| {
                let store = store.clone();
                let scheduler = scheduler.clone();
                let results = results.clone();
                let plan_id = plan_id.clone();
                let goal = goal.clone();
                let architecture_reasoning = architecture_reasoning.clone();
                async move {
                    let snapshot = scheduler.get_status().await;
                    {
                        let mut results = results.lock().await;
                        for task in &snapshot.tasks {
                            if let Some(result) = &task.result {
                                results.insert(task.id.clone(), result.clone());
                            }
                        }
                    }
                    let checkpoint = ExecutionState {
                        plan_id,
                        goal,
                        phase: Phase::Executing,
                        tasks: snapshot.tasks,
                        architecture_reasoning,
                        started_at: chrono::Utc::now(),
                        last_checkpoint: chrono::Utc::now(),
                        metadata: None,
                    };
                    if let Err(e) = store.save(&checkpoint).await {
                        warn!(error = %e, "checkpoint save failed after a task transition");
                    }
                }
            }
        };
        let complete_handler_id = self.event_bus.on(EventType::TaskComplete, checkpoint_handler.clone()).await;
        let failed_handler_id = self.event_bus.on(EventType::TaskFailed, checkpoint_handler).await;

        let run_result = scheduler.run().await;

        self.event_bus.off(complete_handler_id).await;
        self.event_bus.off(failed_handler_id).await;

        state.tasks = scheduler.get_status().await.tasks;

        run_result?;
        self.transition(state, Phase::Documenting).await
    }

    async fn run_documentation(&self, state: &mut ExecutionState, goal: &str) -> EngineResult<()> {
        let raw = self
            .model
            .generate(scribe_prompt(goal, &state.tasks, &state.architecture_reasoning))
            .await
            .map_err(|e| EngineError::ModelApiFailure(e.to_string()))?;
        let readme = verification::strip_code_fence(&raw);
        self.fs.write("README.md", readme.as_bytes()).await.map_err(EngineError::Io)?;
        self.transition(state, Phase::Completed).await
    }

    /// Runs a goal to completion, or resumes the latest non-complete
    /// checkpoint for it when `resume` is set. Each phase boundary is
    /// checkpointed; a fatal error flips the phase to `failed`, checkpoints,
    /// then re-raises (spec.md §7's propagation policy).
    pub async fn run(&self, goal: &str, repo_path: Option<&str>, resume: bool) -> EngineResult<ExecutionState> {
        let mut state = self.load_or_create_state(goal, resume).await?;
        self.event_bus
            .emit(EventType::EngineStart, event_data(vec![("goal", goal.into()), ("planId", state.plan_id.clone().into())]))
            .await;

        let result = self.run_phases(&mut state, goal, repo_path).await;

        match result {
            Ok(()) => {
                self.event_bus
                    .emit(EventType::EngineComplete, event_data(vec![("planId", state.plan_id.clone().into())]))
                    .await;
                Ok(state)
            }
            Err(e) => {
                self.fail(&mut state, &e).await;
                Err(e)
            }
        }
    }

    async fn run_phases(&self, state: &mut ExecutionState, goal: &str, repo_path: Option<&str>) -> EngineResult<()> {
        if state.phase == Phase::Planning {
            let context = self.gather_context(repo_path).await;
            self.run_planning(state, goal, &context).await?;
        }
        if state.phase == Phase::Executing {
            self.run_execution(state).await?;
        }
        if state.phase == Phase::Documenting {
            self.run_documentation(state, goal).await?;
        }
        Ok(())
    }

    pub async fn transition_log(&self) -> Vec<TransitionRecord> {
        self.transitions.lock().await.clone()
    }
}
