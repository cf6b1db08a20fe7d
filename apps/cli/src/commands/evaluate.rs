//! Evaluate command implementation.

use super::{print_json, wait_for};
use crate::colors;
use anyhow::{Result, bail};
use clap::Args;
use colored::Colorize;
use rlstudio_engine::{Engine, Evaluation, NewEvaluation, ProcessingStatus};

#[derive(Args, Debug, Clone)]
pub struct EvaluateArgs {
    /// Model under evaluation
    pub model: String,

    /// Judge model scoring the answers
    #[arg(long, default_value = "gpt-4")]
    pub judge: String,

    /// Prompt to evaluate (repeatable)
    #[arg(long = "prompt", required = true)]
    pub prompts: Vec<String>,

    /// Criterion to score (repeatable)
    #[arg(long = "criterion")]
    pub criteria: Vec<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(engine: &Engine, args: EvaluateArgs) -> Result<()> {
    let json_output = args.json;
    let request = NewEvaluation {
        model: args.model,
        judge_model: args.judge,
        prompts: args.prompts,
        criteria: args.criteria,
    };
    let id = engine.create_evaluation(request).await?;
    if !json_output {
        println!("{} {}", "Evaluating".bold().cyan(), id.dimmed());
    }

    let id = id.as_str();
    let evaluation =
        wait_for(move || engine.get_evaluation(id), |e: &Evaluation| e.status.is_terminal()).await?;

    if json_output {
        print_json(&evaluation)?;
    } else {
        print_report(&evaluation);
    }

    if let Some(error) = evaluation.error {
        bail!("evaluation {} failed: {error}", evaluation.id);
    }
    Ok(())
}

fn print_report(evaluation: &Evaluation) {
    println!();
    println!(
        "  {} {} judged by {} ({})",
        colors::outcome_mark(evaluation.status == ProcessingStatus::Ready),
        evaluation.model.bold(),
        evaluation.judge_model,
        colors::processing_status(evaluation.status)
    );
    if let Some(overall) = evaluation.overall_score {
        println!("  Overall:      {overall:.2}");
    }
    if let Some(scores) = &evaluation.scores {
        println!("  Helpfulness:  {:.2}", scores.helpfulness);
        println!("  Accuracy:     {:.2}", scores.accuracy);
        println!("  Safety:       {:.2}", scores.safety);
        println!("  Clarity:      {:.2}", scores.clarity);
        println!("  Completeness: {:.2}", scores.completeness);
    }
    for example in &evaluation.examples {
        println!();
        println!("  {} {}", "Q:".dimmed(), example.prompt);
        println!("  {} {:.1} {}", "→".cyan(), example.score, example.feedback.dimmed());
    }
    println!();
}
