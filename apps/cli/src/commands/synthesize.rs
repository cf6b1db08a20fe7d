//! Synthesize command implementation.

use super::{print_json, wait_for};
use crate::colors;
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use rlstudio_engine::{Engine, NewSynthesis, ProcessingStatus, SynthesisResult};

#[derive(Args, Debug, Clone)]
pub struct SynthesizeArgs {
    /// Topic to generate examples about
    pub topic: String,

    /// Number of examples to request (capped per batch)
    #[arg(long, default_value_t = 10)]
    pub count: u64,

    /// Difficulty label (easy, medium, hard)
    #[arg(long, default_value = "medium")]
    pub difficulty: String,

    /// Output format label
    #[arg(long, default_value = "jsonl")]
    pub format: String,

    /// Sampling temperature
    #[arg(long, default_value_t = 0.7)]
    pub temperature: f64,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(engine: &Engine, args: SynthesizeArgs) -> Result<()> {
    let json_output = args.json;
    let request = NewSynthesis {
        difficulty: args.difficulty,
        format: args.format,
        temperature: args.temperature,
        ..NewSynthesis::new(args.topic, args.count)
    };
    let id = engine.create_synthesis(request).await?;
    if !json_output {
        println!("{} {}", "Synthesizing".bold().cyan(), id.dimmed());
    }

    let id = id.as_str();
    let result =
        wait_for(move || engine.get_synthesis(id), |r: &SynthesisResult| r.status.is_terminal()).await?;

    if json_output {
        print_json(&result)?;
    } else {
        println!();
        println!(
            "  {} {} ({})",
            colors::outcome_mark(result.status == ProcessingStatus::Ready),
            result.topic.bold(),
            colors::processing_status(result.status)
        );
        println!("  Generated: {} of {} requested", result.num_examples, result.requested_examples);
        if result.num_examples < result.requested_examples {
            println!("  {}", "Batch cap reached; run again for more examples.".dimmed());
        }
        for example in result.examples.iter().take(3) {
            println!();
            println!("  {} {}", "Q:".dimmed(), example.prompt);
            println!("  {} {}", "A:".dimmed(), example.response);
        }
        println!();
    }

    if let Some(error) = result.error {
        bail!("synthesis {} failed: {error}", result.id);
    }
    Ok(())
}
