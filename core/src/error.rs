//! Core error taxonomy shared by every component.

use thiserror::Error;

/// The error kinds visible at the core's boundaries.
///
/// Component-local error enums (`StoreError`, `SchedulerError`, ...) convert
/// into this where a boundary is crossed; see each module for its own
/// error type and how it maps here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("plan invalid: {0}")]
    PlanInvalid(String),

    #[error("Circular dependency detected")]
    CyclicDependency,

    #[error("no tasks are ready to execute")]
    NoReadyTask,

    #[error("task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: String, timeout_ms: u64 },

    #[error("task {task_id} executor failed: {message}")]
    TaskExecutorFailure { task_id: String, message: String },

    #[error("verification exhausted for task {task_id} after {attempts} attempts")]
    VerificationExhausted { task_id: String, attempts: u32 },

    #[error("checkpoint corrupt, treating as no checkpoint")]
    CheckpointCorrupt,

    #[error("model api failure: {0}")]
    ModelApiFailure(String),

    #[error("shell failure (exit {exit_code:?}): {stderr}")]
    ShellFailure { exit_code: Option<i32>, stderr: String },

    #[error("{0} task(s) failed: {1}")]
    TasksFailed(usize, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
