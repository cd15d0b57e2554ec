//! Environment Ports — the narrow, substitutable interfaces the core
//! consumes. Concrete adapters (a real filesystem, a real model API) live
//! outside this crate; `fs.rs` and `shell.rs` ship default local
//! implementations so the library is directly usable, but nothing in
//! `scheduler`, `verification`, or `orchestrator` depends on them
//! concretely.

mod fs;
mod logger;
mod model_port;
mod shell;

pub use fs::{FileStat, Fs, ListOptions, LocalFs};
pub use logger::{Logger, TracingLogger};
pub use model_port::{GenerateRequest, GenerateResponse, ModelProvider, TokenUsage, ToolCall};
pub use shell::{ExecOptions, ExecResult, LocalShell, Runner, Shell, TestResult, TestRunOptions};
