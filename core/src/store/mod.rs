//! State Store — durable, JSON-encoded execution state, one document per
//! `planId` at `<stateDir>/<planId>.json`.
//!
//! Grounded in the teacher's `harness::session::{save,load,clear}_session_state`
//! free functions, generalized to the full save/load/list/delete/exists/
//! find_latest_for_goal/cleanup contract. One deliberate deviation from the
//! teacher: `load_session_state` there propagates a JSON parse error as
//! `Err`; here it is caught and turned into `Ok(None)`, because spec.md
//! requires a corrupted checkpoint to never crash the engine (see
//! `DESIGN.md`).

use std::path::PathBuf;

use chrono::Utc;
use thiserror::Error;
use tracing::warn;

use crate::model::ExecutionState;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A JSON-file-per-plan state store rooted at `state_dir`. Cheap to clone
/// (one `PathBuf`); the Orchestrator hands clones into event-handler
/// closures that outlive any single phase.
#[derive(Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: state_dir.into() }
    }

    fn path_for(&self, plan_id: &str) -> PathBuf {
        self.state_dir.join(format!("{plan_id}.json"))
    }

    /// Rewrites `last_checkpoint` to now, then serializes and writes.
    pub async fn save(&self, state: &ExecutionState) -> StoreResult<()> {
        tokio::fs::create_dir_all(&self.state_dir).await?;
        let mut state = state.clone();
        state.last_checkpoint = Utc::now();
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?;
        tokio::fs::write(self.path_for(&state.plan_id), json).await?;
        Ok(())
    }

    /// Returns `None` on any parse error — a corrupted checkpoint must
    /// never crash the engine.
    pub async fn load(&self, plan_id: &str) -> StoreResult<Option<ExecutionState>> {
        let path = self.path_for(plan_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        match serde_json::from_str::<ExecutionState>(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(plan_id, error = %e, "checkpoint failed to parse, treating as no checkpoint");
                Ok(None)
            }
        }
    }

    /// Enumerates `.json` files; entries whose contents fail to parse are
    /// silently skipped.
    pub async fn list(&self) -> StoreResult<Vec<String>> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub async fn delete(&self, plan_id: &str) -> StoreResult<()> {
        let path = self.path_for(plan_id);
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    pub async fn exists(&self, plan_id: &str) -> bool {
        self.path_for(plan_id).exists()
    }

    /// Ranks by `last_checkpoint`, which is refreshed on every save — so
    /// "latest" means most-recently-touched, not most-recently-created
    /// (see spec.md §9 open question 3).
    pub async fn find_latest_for_goal(&self, goal: &str) -> StoreResult<Option<ExecutionState>> {
        let ids = self.list().await?;
        let mut latest: Option<ExecutionState> = None;
        for id in ids {
            if let Some(state) = self.load(&id).await? {
                if state.goal == goal {
                    let newer = latest
                        .as_ref()
                        .map(|l| state.last_checkpoint > l.last_checkpoint)
                        .unwrap_or(true);
                    if newer {
                        latest = Some(state);
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Sorts by `last_checkpoint` descending and deletes the tail, keeping
    /// the `keep_n` newest.
    pub async fn cleanup(&self, keep_n: usize) -> StoreResult<usize> {
        let ids = self.list().await?;
        let mut loaded = Vec::new();
        for id in &ids {
            if let Some(state) = self.load(id).await? {
                loaded.push((id.clone(), state.last_checkpoint));
            }
        }
        loaded.sort_by(|a, b| b.1.cmp(&a.1));
        let mut deleted = 0;
        for (id, _) in loaded.into_iter().skip(keep_n) {
            self.delete(&id).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

pub fn is_complete(state: &ExecutionState) -> bool {
    state.is_complete()
}

pub fn is_fatally_failed(state: &ExecutionState) -> bool {
    state.is_fatally_failed()
}

/// `plan-<8-hex-sha256(goal)>-<base36-millisecond-timestamp>`.
pub fn make_plan_id(goal: &str, now_millis: i64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(goal.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();
    format!("plan-{hex}-{}", to_base36(now_millis.max(0) as u64))
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap()
}
