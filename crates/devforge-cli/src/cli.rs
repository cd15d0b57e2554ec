//! Command-line argument surface: `devforge <goal> [repo_path] [flags]`.

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "devforge", version, about = "Goal-to-codebase build orchestrator")]
pub struct Args {
    /// What to build, in plain language.
    pub goal: String,

    /// Existing repository to use as context, if any.
    pub repo_path: Option<String>,

    /// Verbose event logging.
    #[arg(short = 'V', long)]
    pub verbose: bool,

    /// Resume the latest checkpoint matching this goal.
    #[arg(short, long)]
    pub resume: bool,

    /// Maximum concurrent tasks.
    #[arg(short, long, default_value_t = 3)]
    pub concurrency: usize,

    /// Model identifier, if the adapter supports selecting one.
    #[arg(short, long)]
    pub model: Option<String>,
}
