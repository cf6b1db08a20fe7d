//! Jobs command implementation.

use super::print_json;
use crate::colors;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use rlstudio_engine::{Engine, JobStatus};

#[derive(Args, Debug, Clone)]
pub struct JobsArgs {
    /// Only show jobs in this status (queued, running, completed, failed, stopped)
    #[arg(long)]
    pub status: Option<JobStatus>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(engine: &Engine, args: JobsArgs) -> Result<()> {
    let jobs = engine.list_jobs(args.status).await?;

    if args.json {
        return print_json(&jobs);
    }

    println!();
    println!("{}", format!("Training Jobs ({})", jobs.len()).bold().cyan());
    println!();

    if jobs.is_empty() {
        println!("  {}", "No training jobs found.".dimmed());
        if engine.config().store_path.is_none() {
            println!();
            println!("  {}", "Tip: pass --store <file> so jobs outlive a single command.".dimmed());
        }
        return Ok(());
    }

    println!("{:<38} {:<24} {:<14} {:<11} {}", "ID", "Name", "Model", "Status", "Progress");
    println!("{}", "─".repeat(100));
    for job in &jobs {
        println!(
            "{:<38} {:<24} {:<14} {:<11} {}/{} ({}%)",
            job.id.to_string().cyan(),
            job.name,
            job.model.dimmed(),
            colors::job_status(job.status),
            job.current_step,
            job.total_steps,
            job.progress
        );
    }
    println!();
    Ok(())
}
