//! docketd: the Docket worker pool daemon.
//!
//! Loads `docket.toml`, starts a worker pool backed by external commands,
//! and streams newline-delimited JSON tasks through it.
//!
//! # Usage
//!
//! ```text
//! docketd check --config docket.toml
//! docketd run --config docket.toml --tasks batch.ndjson
//! cat batch.ndjson | docketd run --config docket.toml
//! ```
//!
//! Pool events go to stdout as JSON lines; logs go to stderr.

mod executor;
mod runner;
mod tasks;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};

use docket_core::{DocketConfig, PoolConfig};
use docket_scheduler::WorkerPool;

use crate::executor::CommandExecutor;

#[derive(Parser)]
#[command(name = "docketd", about = "Docket worker pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file and print the effective settings as JSON.
    Check {
        /// Path to docket.toml.
        #[arg(long)]
        config: PathBuf,
    },
    /// Run the pool over newline-delimited JSON tasks.
    Run {
        /// Path to docket.toml. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Task file. Reads stdin when omitted.
        #[arg(long)]
        tasks: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,docketd=debug,docket=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => check(&config),
        Command::Run { config, tasks } => run(config.as_deref(), tasks).await,
    }
}

fn load(path: Option<&Path>) -> anyhow::Result<(DocketConfig, PoolConfig)> {
    let file = match path {
        Some(path) => DocketConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DocketConfig::default(),
    };
    let config = file
        .into_pool_config()
        .context("invalid pool configuration")?;
    Ok((file, config))
}

fn check(path: &Path) -> anyhow::Result<()> {
    let (file, config) = load(Some(path))?;
    let mut effective = DocketConfig::from_pool_config(&config);
    effective.executor = file.executor;
    println!("{}", serde_json::to_string_pretty(&effective)?);
    info!(path = %path.display(), "configuration is valid");
    Ok(())
}

async fn run(config_path: Option<&Path>, tasks: Option<PathBuf>) -> anyhow::Result<()> {
    let (file, config) = load(config_path)?;
    let commands: BTreeMap<String, Vec<String>> = file.executor_commands();
    let executor = CommandExecutor::new(commands);

    for task_type in config.compatibility.task_types() {
        if executor.command_for(task_type).is_none() {
            warn!(task_type, "no executor command configured; tasks of this type will fail");
        }
    }
    for task_type in executor.task_types() {
        if config.compatibility.worker_types_for(task_type).is_none() {
            warn!(task_type, "executor command has no compatible worker type");
        }
    }

    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &tasks {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(tokio::io::stdin())),
    };

    info!(
        min_workers = config.min_workers,
        max_workers = config.max_workers,
        strategy = ?config.strategy,
        "docket daemon starting"
    );
    let pool = WorkerPool::new(config, Arc::new(executor));

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler; run until the input drains.
            std::future::pending::<()>().await;
        }
    };

    runner::run(&pool, input, std::io::stdout(), shutdown).await?;
    info!("docket daemon stopped");
    Ok(())
}
