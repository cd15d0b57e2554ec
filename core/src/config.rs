//! Engine-wide configuration, layered the way the teacher's `SwarmConfig`
//! layers environment-provided overrides atop sane defaults.

use std::path::PathBuf;

/// Scheduler and verification-loop tuning knobs plus storage location.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrency: usize,
    pub default_max_attempts: u32,
    pub task_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub verification_max_retries: u32,
    pub max_history_size: usize,
    pub state_dir: PathBuf,
    pub model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            default_max_attempts: 3,
            task_timeout_ms: 300_000,
            retry_delay_ms: 1_000,
            verification_max_retries: 3,
            max_history_size: 1_000,
            state_dir: default_state_dir(),
            model: None,
        }
    }
}

/// The conventional hidden state directory, created lazily on first save.
fn default_state_dir() -> PathBuf {
    PathBuf::from(".devforge").join("state")
}
