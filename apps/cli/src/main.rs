//! RL Studio CLI - drive the training orchestration engine from a terminal.
//!
//! The `rlstudio` binary starts an in-process engine, runs one command
//! against it and shuts it down. Pass `--store` to keep jobs and records
//! between invocations.

mod colors;
mod commands;

use clap::{Parser, Subcommand};
use rlstudio_engine::{Engine, EngineConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use commands::{evaluate, ingest, jobs, models, synthesize, train};

/// Filter applied when neither `--log-level` nor `RUST_LOG` is set.
const DEFAULT_LOG_FILTER: &str = "rlstudio_engine=info,info";

/// RL Studio - fine-tune, evaluate and synthesize data for language models
#[derive(Parser, Debug)]
#[command(
    name = "rlstudio",
    author,
    version,
    about = "RL Studio - training job orchestration",
    long_about = "Runs training jobs, dataset ingestion, model evaluation and data synthesis\nagainst the RL Studio engine, streaming live metrics to the terminal."
)]
struct Args {
    /// Log filter (e.g. debug, warn, rlstudio_engine=trace); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Path to an engine config file (defaults to ./rlstudio.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// JSON state file; jobs and records persist there across runs
    #[arg(short, long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a training job and stream its metrics until it finishes
    Train(train::TrainArgs),

    /// List training jobs
    Jobs(jobs::JobsArgs),

    /// Register a dataset and wait for ingestion
    Ingest(ingest::IngestArgs),

    /// Judge a model's answers to a set of prompts
    Evaluate(evaluate::EvaluateArgs),

    /// Generate synthetic training examples for a topic
    Synthesize(synthesize::SynthesizeArgs),

    /// Show the base model catalog
    Models(models::ModelsArgs),
}

fn init_tracing(log_level: Option<&str>) -> anyhow::Result<()> {
    let filter = match log_level {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref())?;

    let mut config = EngineConfig::discover_and_load(args.config.as_deref())?;
    if let Some(store) = args.store {
        config.store_path = Some(store);
    }

    let engine = Engine::open(config).await?;
    let result = match args.command {
        Command::Train(cmd) => train::execute(&engine, cmd).await,
        Command::Jobs(cmd) => jobs::execute(&engine, cmd).await,
        Command::Ingest(cmd) => ingest::execute(&engine, cmd).await,
        Command::Evaluate(cmd) => evaluate::execute(&engine, cmd).await,
        Command::Synthesize(cmd) => synthesize::execute(&engine, cmd).await,
        Command::Models(cmd) => models::execute(&engine, cmd).await,
    };

    engine.shutdown().await;
    result
}
