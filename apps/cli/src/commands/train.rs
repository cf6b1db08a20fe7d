//! Training command implementation.

use super::{print_json, wait_for};
use crate::colors;
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use rlstudio_engine::{Engine, Job, JobStatus, MetricsSnapshot, NewJob, StopOutcome, channel_sink};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Buffered snapshots before the broadcaster treats the terminal as lagging.
const METRICS_BUFFER: usize = 256;

#[derive(Args, Debug, Clone)]
pub struct TrainArgs {
    /// Base model to fine-tune
    #[arg(long, default_value = "gpt2-small")]
    pub model: String,

    /// Dataset to train on
    #[arg(long, default_value = "python-code")]
    pub dataset: String,

    /// Display name for the job
    #[arg(long)]
    pub name: Option<String>,

    /// Total training steps (defaults to the configured value)
    #[arg(long)]
    pub steps: Option<u64>,

    /// Learning rate override
    #[arg(long)]
    pub learning_rate: Option<f64>,

    /// Batch size override
    #[arg(long)]
    pub batch_size: Option<u32>,

    /// Stop the job once it reaches this step
    #[arg(long)]
    pub stop_at: Option<u64>,

    /// Print the finished job and its metrics as JSON
    #[arg(long)]
    pub json: bool,
}

impl TrainArgs {
    fn into_request(self, engine: &Engine) -> NewJob {
        let mut hyperparams = engine.config().default_hyperparams.clone();
        if let Some(learning_rate) = self.learning_rate {
            hyperparams.learning_rate = learning_rate;
        }
        if let Some(batch_size) = self.batch_size {
            hyperparams.batch_size = batch_size;
        }

        let mut request = NewJob::new(self.model, self.dataset).with_hyperparams(hyperparams);
        if let Some(name) = self.name {
            request = request.with_name(name);
        }
        if let Some(steps) = self.steps {
            request = request.with_total_steps(steps);
        }
        request
    }
}

pub async fn execute(engine: &Engine, args: TrainArgs) -> Result<()> {
    let json_output = args.json;
    let stop_at = args.stop_at;
    let job_id = engine.create_job(args.into_request(engine)).await?;

    if !json_output {
        let job = engine.get_job(&job_id).await?;
        println!();
        println!("{}", "Training job started".bold().cyan());
        println!("  Job:     {}", job.id.to_string().cyan());
        println!("  Model:   {}", job.model);
        println!("  Dataset: {}", job.dataset);
        println!("  Steps:   {}", job.total_steps);
        println!();
    }

    let (sink, mut rx) = channel_sink(METRICS_BUFFER);
    let subscription = engine.subscribe_metrics(&job_id, Arc::new(sink)).await?;
    debug!(job_id = %job_id, subscription = ?subscription, "Streaming metrics");

    let mut stream = Vec::new();
    let mut stop_requested = false;
    while let Some(metrics) = rx.recv().await {
        if !json_output {
            print_snapshot(&metrics);
        }
        let reached = metrics.step;
        stream.push(metrics);

        if !stop_requested && stop_at.is_some_and(|limit| reached >= limit) {
            stop_requested = true;
            match engine.stop_job(&job_id).await? {
                StopOutcome::Stopped if !json_output => {
                    println!("  {} stop requested at step {}", "■".yellow(), reached);
                }
                _ => {}
            }
        }
    }

    // The stream also ends if the terminal fell behind; the record is authoritative.
    let job_id = &job_id;
    let job = wait_for(move || engine.get_job(job_id), Job::is_terminal).await?;

    if json_output {
        print_json(&json!({ "job": job, "metrics": stream }))?;
    } else {
        print_summary(&job);
    }

    if job.status == JobStatus::Failed {
        bail!("training job {} failed: {}", job.id, job.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

fn print_snapshot(metrics: &MetricsSnapshot) {
    println!(
        "  step {:>6}  loss {:>8.4}  reward {:>7.3}  kl {:>7.4}  {:>7.1} tok/s  gpu {:>5.1}%",
        metrics.step.to_string().cyan(),
        metrics.loss,
        metrics.reward,
        metrics.kl_divergence,
        metrics.tokens_per_second,
        metrics.gpu_utilization,
    );
}

fn print_summary(job: &Job) {
    println!();
    println!(
        "  {} {} ({})",
        colors::outcome_mark(job.status != JobStatus::Failed),
        "Job".bold(),
        colors::job_status(job.status)
    );
    println!("  Step:     {}/{} ({}%)", job.current_step, job.total_steps, job.progress);
    println!("  Loss:     {:.4}", job.loss);
    println!("  Reward:   {:.3}", job.reward);
    if let Some(error) = &job.error {
        println!("  Error:    {}", error.red());
    }
    println!();
}
