//! Verification Loop — the per-task executor callback the Orchestrator
//! hands to the Scheduler (§4.F's `Executor` type).
//!
//! Mirrors the teacher's `orchestrator::process_issue` generate→gate→fix
//! shape and `verifier::pipeline`'s run-then-classify gate, and builds its
//! prompts the way `crates/swarm-agents/src/main.rs::format_task_prompt`
//! assembles a `WorkPacket` into a single Markdown prompt — generalized
//! from that file's Rust-specific packet fields to this task's
//! dependency-context/classified-error fields.
//!
//! Per spec.md §9 open question 2, the Scheduler's `defaultMaxAttempts` and
//! this loop's own `maxRetries` stay distinct layers; a task's total model
//! invocations are bounded by their product rather than collapsing to
//! `outer <= 1`. Exhaustion here surfaces as a single `Err(String)`, which
//! the Scheduler treats like any other executor failure — it alone decides
//! whether to retry or cascade-skip.
//!
//! Per spec.md §9 open question 1, the Fixer prompt tells the model it may
//! flag the test itself as wrong, but this loop only ever rewrites the
//! source file from the Fixer's output. `FixVerdict` is left with a single
//! variant as the extension point a future loop could grow into.

use std::sync::Arc;

use crate::classifier;
use crate::digest::{self, DigestOptions};
use crate::model::{Task, TaskType};
use crate::ports::{Fs, GenerateRequest, ModelProvider, Shell, TestRunOptions};

/// Where a Fixer's output should land. Only `RewriteSource` is implemented;
/// the variant exists so a future Fixer that can also amend the test file
/// has somewhere to plug in without changing this loop's return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixVerdict {
    RewriteSource,
}

#[derive(Debug, Clone)]
pub struct VerificationOptions {
    pub max_retries: u32,
    pub task_timeout_ms: u64,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self { max_retries: 3, task_timeout_ms: 300_000 }
    }
}

const SOURCE_EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "rs", "py", "go"];

fn is_test_file(path: &str) -> bool {
    path.contains(".test.") || path.contains(".spec.") || path.ends_with("_test.rs")
}

fn should_verify(task: &Task) -> bool {
    if task.task_type != TaskType::Code {
        return false;
    }
    if is_test_file(&task.file_path) {
        return false;
    }
    SOURCE_EXTENSIONS
        .iter()
        .any(|ext| task.file_path.ends_with(&format!(".{ext}")))
}

/// Inserts `.test` before a path's final extension: `src/widget.ts` ->
/// `src/widget.test.ts`.
fn test_path_for(file_path: &str) -> String {
    match file_path.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.test.{ext}"),
        None => format!("{file_path}.test"),
    }
}

/// Strips a single leading/trailing Markdown code fence, if present —
/// models routinely wrap generated source in ```lang ... ``` even when
/// asked not to. Shared with the Orchestrator's Scribe step, which wraps
/// the same model surface for a different prompt.
pub(crate) fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let without_lang = rest.splitn(2, '\n').nth(1).unwrap_or(rest);
        without_lang.strip_suffix("```").unwrap_or(without_lang).trim().to_string()
    } else {
        trimmed.to_string()
    }
}

/// Everything the executor needs besides the `Task` itself. Built once by
/// the Orchestrator and shared across every task's closure.
pub struct VerificationContext {
    pub fs: Arc<dyn Fs>,
    pub shell: Arc<dyn Shell>,
    pub model: Arc<dyn ModelProvider>,
    pub options: VerificationOptions,
}

impl VerificationContext {
    /// For each dependency id, look up its completed sibling's digested
    /// result; concatenate in dependency-list order. This is the only
    /// cross-task context a Build/Audit/Fix prompt ever sees.
    fn build_dependency_context(&self, task: &Task, results: &std::collections::HashMap<String, String>) -> String {
        let mut sections = Vec::new();
        for dep_id in &task.dependencies {
            if let Some(result) = results.get(dep_id) {
                let digested = digest::digest(dep_id, result, &DigestOptions::default());
                if !digested.is_empty() {
                    sections.push(format!("### Dependency `{dep_id}`\n{digested}"));
                }
            }
        }
        sections.join("\n\n")
    }

    fn builder_prompt(&self, task: &Task, dependency_context: &str) -> GenerateRequest {
        let mut prompt = String::new();
        prompt.push_str(&format!("# Task: {}\n\n", task.description));
        prompt.push_str(&format!("**File:** `{}` | **Type:** {:?}\n\n", task.file_path, task.task_type));
        if !dependency_context.is_empty() {
            prompt.push_str("## Dependency Context\n");
            prompt.push_str(dependency_context);
            prompt.push_str("\n\n");
        }
        prompt.push_str("Produce the complete contents of this file. Respond with only the file's source, no prose, no Markdown code fences.\n");
        GenerateRequest::new(
            "You are a careful software engineer implementing one file of a larger plan.",
            prompt,
        )
    }

    fn auditor_prompt(&self, task: &Task, source: &str, test_path: &str) -> GenerateRequest {
        let prompt = format!(
            "# Write a test for: {}\n\n**Source file:** `{}`\n**Test file:** `{}`\n\n## Current Source\n```\n{}\n```\n\nWrite a test file that exercises this source's stated behavior. Respond with only the test file's source, no prose, no Markdown code fences.\n",
            task.description, task.file_path, test_path, source
        );
        GenerateRequest::new(
            "You are a meticulous test author verifying another engineer's work.",
            prompt,
        )
    }

    fn fixer_prompt(&self, task: &Task, source: &str, classified: &[crate::model::ClassifiedError]) -> GenerateRequest {
        let mut prompt = String::new();
        prompt.push_str(&format!("# Fix: {}\n\n**File:** `{}`\n\n", task.description, task.file_path));
        prompt.push_str("## Current Errors to Fix\n");
        for err in classified {
            prompt.push_str(&format!("- **{}**: {}\n", err.category, err.message));
            if let Some(file) = &err.file {
                prompt.push_str(&format!("  At: {file}:{}\n", err.line.unwrap_or(0)));
            }
            if let (Some(expected), Some(actual)) = (&err.expected, &err.actual) {
                prompt.push_str(&format!("  Expected: {expected}\n  Actual: {actual}\n"));
            }
            if let Some(suggestion) = &err.suggestion {
                prompt.push_str(&format!("  Suggestion: {suggestion}\n"));
            }
            prompt.push_str(&format!("\n{}\n\n", classifier::get_fix_strategy(err.category)));
        }
        prompt.push_str("## Current Source\n```\n");
        prompt.push_str(source);
        prompt.push_str("\n```\n\nIf the test's expectation is wrong rather than the source, say so in one sentence, then still return a corrected source file — this loop only ever rewrites the source. Respond with only the corrected file's source, no prose, no Markdown code fences.\n");
        GenerateRequest::new(
            "You are fixing a failing implementation given classified test failures.",
            prompt,
        )
    }

    /// The executor closure body: run for one task, return its final
    /// source on success or a failure message on exhaustion.
    pub async fn execute(
        &self,
        task: Task,
        results: std::collections::HashMap<String, String>,
    ) -> Result<String, String> {
        let dependency_context = self.build_dependency_context(&task, &results);

        let builder_request = self.builder_prompt(&task, &dependency_context);
        let generated = self
            .model
            .generate(builder_request)
            .await
            .map_err(|e| format!("model generation failed for {}: {e}", task.id))?;
        let mut source = strip_code_fence(&generated);

        self.fs
            .write(&task.file_path, source.as_bytes())
            .await
            .map_err(|e| format!("failed to write {}: {e}", task.file_path))?;

        if !should_verify(&task) {
            return Ok(source);
        }

        let test_path = test_path_for(&task.file_path);
        let runner = self.shell.get_test_runner().await;

        for _attempt in 0..self.options.max_retries {
            let test_request = self.auditor_prompt(&task, &source, &test_path);
            let generated_test = self
                .model
                .generate(test_request)
                .await
                .map_err(|e| format!("test generation failed for {}: {e}", task.id))?;
            let test_source = strip_code_fence(&generated_test);
            self.fs
                .write(&test_path, test_source.as_bytes())
                .await
                .map_err(|e| format!("failed to write {test_path}: {e}"))?;

            let run_result = runner
                .run(&test_path, TestRunOptions { timeout_ms: Some(self.options.task_timeout_ms), ..Default::default() })
                .await
                .map_err(|e| format!("test runner failed for {test_path}: {e}"))?;

            if run_result.passed {
                return Ok(source);
            }

            let classified = classifier::analyze_multiple(&run_result.raw_output, 1);
            let primary = classified.first().cloned().unwrap_or_else(|| classifier::classify(&run_result.raw_output, 1));
            let fixer_request = self.fixer_prompt(&task, &source, std::slice::from_ref(&primary));
            let fixed = self
                .model
                .generate(fixer_request)
                .await
                .map_err(|e| format!("fix generation failed for {}: {e}", task.id))?;
            source = strip_code_fence(&fixed);
            self.fs
                .write(&task.file_path, source.as_bytes())
                .await
                .map_err(|e| format!("failed to write {}: {e}", task.file_path))?;
        }

        Err(format!(
            "{} failed verification after {} attempts",
            task.id, self.options.max_retries
        ))
    }
}

/// Builds the `scheduler::Executor` closure the Orchestrator passes to the
/// Scheduler, capturing a snapshot of completed sibling results at
/// construction time plus a live handle the Orchestrator refreshes as
/// siblings complete.
pub fn build_executor(
    ctx: Arc<VerificationContext>,
    results: Arc<tokio::sync::Mutex<std::collections::HashMap<String, String>>>,
) -> crate::scheduler::Executor {
    Arc::new(move |task: Task| {
        let ctx = ctx.clone();
        let results = results.clone();
        Box::pin(async move {
            let snapshot = results.lock().await.clone();
            ctx.execute(task, snapshot).await
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClassifiedError, ErrorCategory};
    use std::collections::HashSet;
    use crate::ports::{ExecOptions, ExecResult, FileStat, GenerateResponse, ListOptions, Runner, TestResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeFs {
        written: StdMutex<HashMap<String, String>>,
    }

    impl FakeFs {
        fn new() -> Self {
            Self { written: StdMutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl Fs for FakeFs {
        async fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
            self.written
                .lock()
                .unwrap()
                .get(path)
                .map(|s| s.as_bytes().to_vec())
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, path.to_string()))
        }
        async fn write(&self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
            self.written
                .lock()
                .unwrap()
                .insert(path.to_string(), String::from_utf8_lossy(bytes).to_string());
            Ok(())
        }
        async fn exists(&self, path: &str) -> bool {
            self.written.lock().unwrap().contains_key(path)
        }
        async fn mkdir(&self, _path: &str, _recursive: bool) -> std::io::Result<()> {
            Ok(())
        }
        async fn delete(&self, path: &str) -> std::io::Result<()> {
            self.written.lock().unwrap().remove(path);
            Ok(())
        }
        async fn list(&self, _dir: &str, _options: ListOptions) -> std::io::Result<Vec<String>> {
            Ok(self.written.lock().unwrap().keys().cloned().collect())
        }
        async fn stat(&self, _path: &str) -> std::io::Result<FileStat> {
            Ok(FileStat { is_dir: false, is_file: true, size: 0 })
        }
    }

    struct FixedRunner {
        results: StdMutex<Vec<TestResult>>,
    }

    #[async_trait]
    impl Runner for FixedRunner {
        async fn run(&self, _test_path: &str, _opts: TestRunOptions) -> std::io::Result<TestResult> {
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                Ok(results.remove(0))
            } else {
                Ok(results[0].clone())
            }
        }
    }

    struct FakeShell {
        runner_results: Vec<TestResult>,
    }

    #[async_trait]
    impl Shell for FakeShell {
        async fn exec(&self, _cmd: &str, _opts: ExecOptions) -> std::io::Result<ExecResult> {
            Ok(ExecResult { stdout: String::new(), stderr: String::new(), exit_code: Some(0), timed_out: false })
        }
        async fn get_test_runner(&self) -> Box<dyn Runner> {
            Box::new(FixedRunner { results: StdMutex::new(self.runner_results.clone()) })
        }
    }

    struct ScriptedModel {
        responses: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn generate(&self, _request: GenerateRequest) -> anyhow::Result<String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(String::new())
            } else {
                Ok(responses.remove(0))
            }
        }
        async fn generate_with_meta(&self, request: GenerateRequest) -> anyhow::Result<GenerateResponse> {
            let content = self.generate(request).await?;
            Ok(GenerateResponse { content, tool_calls: Vec::new(), usage: None })
        }
    }

    fn code_task(file_path: &str) -> Task {
        Task::new("t1", file_path, "build a widget", TaskType::Code, HashSet::new(), 0, 3)
    }

    #[tokio::test]
    async fn non_code_task_skips_verification_entirely() {
        let fs = Arc::new(FakeFs::new());
        let model = Arc::new(ScriptedModel { responses: StdMutex::new(vec!["export const x = 1;".to_string()]) });
        let shell = Arc::new(FakeShell { runner_results: vec![] });
        let ctx = VerificationContext { fs, shell, model, options: VerificationOptions::default() };
        let mut task = code_task("README.md");
        task.task_type = TaskType::Docs;
        let result = ctx.execute(task, HashMap::new()).await.unwrap();
        assert_eq!(result, "export const x = 1;");
    }

    #[tokio::test]
    async fn passes_on_first_try_returns_generated_source() {
        let fs = Arc::new(FakeFs::new());
        let model = Arc::new(ScriptedModel {
            responses: StdMutex::new(vec![
                "export const widget = 1;".to_string(),
                "test('widget', () => {});".to_string(),
            ]),
        });
        let shell = Arc::new(FakeShell {
            runner_results: vec![TestResult {
                passed: true,
                num_passed: 1,
                num_failed: 0,
                num_skipped: 0,
                failures: vec![],
                duration_ms: 5,
                raw_output: String::new(),
            }],
        });
        let ctx = VerificationContext { fs, shell, model, options: VerificationOptions::default() };
        let result = ctx.execute(code_task("src/widget.ts"), HashMap::new()).await.unwrap();
        assert_eq!(result, "export const widget = 1;");
    }

    #[tokio::test]
    async fn retries_until_pass_then_returns_fixed_source() {
        let fs = Arc::new(FakeFs::new());
        let model = Arc::new(ScriptedModel {
            responses: StdMutex::new(vec![
                "export const widget = 1;".to_string(),
                "test('widget', () => {});".to_string(),
                "export const widget = 2;".to_string(),
            ]),
        });
        let shell = Arc::new(FakeShell {
            runner_results: vec![
                TestResult {
                    passed: false,
                    num_passed: 0,
                    num_failed: 1,
                    num_skipped: 0,
                    failures: vec!["AssertionError: expected 1 to be 2".to_string()],
                    duration_ms: 5,
                    raw_output: "AssertionError: expected 1 to be 2".to_string(),
                },
                TestResult {
                    passed: true,
                    num_passed: 1,
                    num_failed: 0,
                    num_skipped: 0,
                    failures: vec![],
                    duration_ms: 5,
                    raw_output: String::new(),
                },
            ],
        });
        let ctx = VerificationContext {
            fs,
            shell,
            model,
            options: VerificationOptions { max_retries: 3, task_timeout_ms: 1_000 },
        };
        let result = ctx.execute(code_task("src/widget.ts"), HashMap::new()).await.unwrap();
        assert_eq!(result, "export const widget = 2;");
    }

    #[tokio::test]
    async fn exhausting_retries_returns_err() {
        let fs = Arc::new(FakeFs::new());
        let model = Arc::new(ScriptedModel {
            responses: StdMutex::new(vec![
                "export const widget = 1;".to_string(),
                "test one".to_string(),
                "export const widget = 2;".to_string(),
                "test two".to_string(),
                "export const widget = 3;".to_string(),
                "test three".to_string(),
                "export const widget = 4;".to_string(),
            ]),
        });
        let failing = TestResult {
            passed: false,
            num_passed: 0,
            num_failed: 1,
            num_skipped: 0,
            failures: vec!["AssertionError: still wrong".to_string()],
            duration_ms: 5,
            raw_output: "AssertionError: still wrong".to_string(),
        };
        let shell = Arc::new(FakeShell { runner_results: vec![failing] });
        let ctx = VerificationContext {
            fs,
            shell,
            model,
            options: VerificationOptions { max_retries: 3, task_timeout_ms: 1_000 },
        };
        let result = ctx.execute(code_task("src/widget.ts"), HashMap::new()).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("failed verification"));
    }

    #[test]
    fn test_path_inserts_dot_test_before_extension() {
        assert_eq!(test_path_for("src/widget.ts"), "src/widget.test.ts");
    }

    #[test]
    fn strip_code_fence_removes_markdown_wrapper() {
        let wrapped = "```ts\nexport const x = 1;\n```";
        assert_eq!(strip_code_fence(wrapped), "export const x = 1;");
    }

    #[test]
    fn classified_error_category_drives_fix_strategy_text() {
        let err = ClassifiedError {
            category: ErrorCategory::Type,
            message: "boom".to_string(),
            file: None,
            line: None,
            column: None,
            expected: None,
            actual: None,
            suggestion: None,
            original_error: "boom".to_string(),
        };
        assert!(classifier::get_fix_strategy(err.category).contains("type"));
    }
}
