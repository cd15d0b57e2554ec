use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use devforge_cli::cli::Args;
use devforge_cli::http_model;
use devforge_core::config::EngineConfig;
use devforge_core::ports::{LocalFs, LocalShell};
use devforge_core::Engine;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if args.verbose { "debug".into() } else { "info".into() }
        }))
        .init();

    let Some(model) = http_model::resolve_from_env(args.model.as_deref()) else {
        error!("Required environment variable OPENAI_API_KEY or OPENCLAW_KEY is not set");
        std::process::exit(1);
    };

    let root = args.repo_path.clone().unwrap_or_else(|| ".".to_string());
    let fs = Arc::new(LocalFs::new(&root));
    let shell = Arc::new(LocalShell::new(&root));

    let config = EngineConfig { max_concurrency: args.concurrency, ..EngineConfig::default() };
    let engine = Engine::new(fs, shell, Arc::new(model), config);

    if args.verbose {
        engine
            .event_bus()
            .on_any(|event| async move {
                info!(event = ?event.event_type, data = ?event.data, "event");
            })
            .await;
    }

    info!(goal = %args.goal, resume = args.resume, concurrency = args.concurrency, "starting run");

    match engine.run(&args.goal, args.repo_path.as_deref(), args.resume).await {
        Ok(state) => {
            info!(plan_id = %state.plan_id, phase = ?state.phase, tasks = state.tasks.len(), "run finished");
            Ok(())
        }
        Err(e) => {
            error!("run failed: {e}");
            std::process::exit(1);
        }
    }
}
