//! Models command implementation.

use super::print_json;
use anyhow::Result;
use clap::Args;
use colored::Colorize;
use rlstudio_engine::Engine;

#[derive(Args, Debug, Clone)]
pub struct ModelsArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// List the base models available for training.
pub async fn execute(engine: &Engine, args: ModelsArgs) -> Result<()> {
    let models = engine.list_models().await?;

    if args.json {
        return print_json(&models);
    }

    println!();
    println!("{}", format!("Base Models ({})", models.len()).bold().cyan());
    println!();
    println!("{:<14} {:<16} {:<10} {}", "ID", "Name", "Size", "Parameters");
    println!("{}", "─".repeat(70));
    for model in &models {
        let recommended = if model.recommended { "(recommended)".green() } else { "".dimmed() };
        println!(
            "{:<14} {:<16} {:<10} {:<12} {}",
            model.id.cyan(),
            model.name,
            model.size.dimmed(),
            model.parameters,
            recommended
        );
    }
    println!();
    Ok(())
}
