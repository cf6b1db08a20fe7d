//! Ingest command implementation.

use super::{print_json, wait_for};
use crate::colors;
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use rlstudio_engine::{Dataset, Engine, NewDataset, ProcessingStatus};

#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Dataset name
    pub name: String,

    /// Free-form description
    #[arg(long, default_value = "")]
    pub description: String,

    /// Source format (json, jsonl, csv, ...)
    #[arg(long)]
    pub format: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(engine: &Engine, args: IngestArgs) -> Result<()> {
    let json_output = args.json;
    let request = NewDataset { name: args.name, description: args.description, format: args.format };
    let id = engine.create_dataset(request).await?;
    if !json_output {
        println!("{} {}", "Ingesting dataset".bold().cyan(), id.dimmed());
    }

    let id = id.as_str();
    let dataset = wait_for(move || engine.get_dataset(id), |d: &Dataset| d.status.is_terminal()).await?;

    if json_output {
        print_json(&dataset)?;
    } else {
        println!();
        println!(
            "  {} {} ({})",
            colors::outcome_mark(dataset.status == ProcessingStatus::Ready),
            dataset.name.bold(),
            colors::processing_status(dataset.status)
        );
        println!("  Format:   {}", dataset.format);
        println!("  Size:     {}", dataset.size);
        println!("  Examples: {}", dataset.examples);
        println!();
    }

    if let Some(error) = dataset.error {
        bail!("dataset {} failed: {error}", dataset.id);
    }
    Ok(())
}
