//! The core data model: `Task`, `Plan`, `ExecutionState`, `ClassifiedError`,
//! `EngineEvent`, and the enums they're built from.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A task's place in its lifecycle.
///
/// `SKIPPED` is terminal and reachable only via a `FAILED` ancestor (see
/// the Scheduler's cascading-skip pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// The kind of artifact a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Test,
    Config,
    Docs,
}

/// A unit of work producing one artifact at a declared path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Opaque, unique-within-plan identity.
    pub id: String,
    pub file_path: String,
    pub description: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Higher runs first; stable tie-break is insertion order.
    #[serde(default)]
    pub priority: i32,
    /// Ids of parent tasks. Dangling ids are dropped at load time (the
    /// Scheduler logs a warning; see `scheduler::TaskScheduler::load_plan`).
    #[serde(default)]
    pub dependencies: HashSet<String>,

    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    /// Construct a fresh, not-yet-scheduled task from a plan descriptor.
    pub fn new(
        id: impl Into<String>,
        file_path: impl Into<String>,
        description: impl Into<String>,
        task_type: TaskType,
        dependencies: HashSet<String>,
        priority: i32,
        max_attempts: u32,
    ) -> Self {
        Self {
            id: id.into(),
            file_path: file_path.into(),
            description: description.into(),
            task_type,
            priority,
            dependencies,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// An ordered list of tasks plus the model's free-form planning rationale.
/// Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub architecture_reasoning: String,
}

/// The orchestrator's phase state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Documenting,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The checkpoint unit: a durable snapshot of a run's execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub plan_id: String,
    pub goal: String,
    pub phase: Phase,
    pub tasks: Vec<Task>,
    pub architecture_reasoning: String,
    pub started_at: DateTime<Utc>,
    pub last_checkpoint: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl ExecutionState {
    pub fn new(plan_id: impl Into<String>, goal: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            plan_id: plan_id.into(),
            goal: goal.into(),
            phase: Phase::Planning,
            tasks: Vec::new(),
            architecture_reasoning: String::new(),
            started_at: now,
            last_checkpoint: now,
            metadata: None,
        }
    }

    /// Whether the run is done: explicitly completed, or every task reached
    /// `COMPLETED`.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Completed
            || (!self.tasks.is_empty()
                && self
                    .tasks
                    .iter()
                    .all(|t| t.status == TaskStatus::Completed))
    }

    /// Whether the run failed in a way that won't be retried: `phase ==
    /// failed` and some task exhausted its attempt budget.
    pub fn is_fatally_failed(&self) -> bool {
        self.phase == Phase::Failed
            && self
                .tasks
                .iter()
                .any(|t| t.status == TaskStatus::Failed && t.attempts >= 3)
    }
}

/// The error taxonomy the classifier tags raw tool output with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Type,
    Import,
    Runtime,
    Assertion,
    Timeout,
    Permission,
    Resource,
    Network,
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Syntax => "syntax",
            Self::Type => "type",
            Self::Import => "import",
            Self::Runtime => "runtime",
            Self::Assertion => "assertion",
            Self::Timeout => "timeout",
            Self::Permission => "permission",
            Self::Resource => "resource",
            Self::Network => "network",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A single classified failure, extracted from raw stderr + exit code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub suggestion: Option<String>,
    pub original_error: String,
}

/// The enumerated engine event types, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EngineStart,
    EngineComplete,
    EngineError,
    PhaseStart,
    PhaseComplete,
    TaskStart,
    TaskProgress,
    TaskComplete,
    TaskFailed,
    TaskRetry,
    LlmRequest,
    LlmResponse,
    LlmStream,
    CheckpointSaved,
    CheckpointRestored,
}

/// A fire-and-forget observation. Absence of a subscriber never affects
/// execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: HashMap<String, serde_json::Value>,
}

impl EngineEvent {
    pub fn new(event_type: EventType, data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}
