//! Integration tests for the ingest, evaluate and synthesize commands.

mod common;

use common::{json_output, rlstudio};
use predicates::prelude::*;

#[test]
fn test_ingest_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let dataset = json_output(rlstudio(dir.path()).args(["ingest", "python-code", "--format", "csv", "--json"]));

    assert_eq!(dataset["status"], "ready");
    assert_eq!(dataset["name"], "python-code");
    assert_eq!(dataset["format"], "csv");
    assert!(dataset["examples"].as_u64().unwrap() >= 1000);
}

#[test]
fn test_evaluate_keeps_example_cap() {
    let dir = tempfile::tempdir().unwrap();
    let evaluation = json_output(rlstudio(dir.path()).args([
        "evaluate",
        "gpt2-small",
        "--prompt",
        "What is Rust?",
        "--prompt",
        "Explain borrowing",
        "--prompt",
        "What is a trait?",
        "--prompt",
        "Define a lifetime",
        "--criterion",
        "accuracy",
        "--json",
    ]));

    assert_eq!(evaluation["status"], "ready");
    assert_eq!(evaluation["judgeModel"], "gpt-4");
    assert_eq!(evaluation["prompts"].as_array().unwrap().len(), 4);
    assert_eq!(evaluation["examples"].as_array().unwrap().len(), 3);
    assert!(evaluation["scores"]["safety"].is_number());
}

#[test]
fn test_evaluate_requires_prompts() {
    let dir = tempfile::tempdir().unwrap();
    rlstudio(dir.path()).args(["evaluate", "gpt2-small"]).assert().failure();
}

#[test]
fn test_synthesize_is_capped() {
    let dir = tempfile::tempdir().unwrap();
    let result = json_output(rlstudio(dir.path()).args(["synthesize", "binary search", "--count", "500", "--json"]));

    assert_eq!(result["status"], "ready");
    assert_eq!(result["requestedExamples"], 500);
    assert_eq!(result["numExamples"], 50);
    assert_eq!(result["examples"].as_array().unwrap().len(), 50);
}

#[test]
fn test_synthesize_human_output_mentions_cap() {
    let dir = tempfile::tempdir().unwrap();
    rlstudio(dir.path())
        .args(["synthesize", "closures", "--count", "80"])
        .assert()
        .success()
        .stdout(predicate::str::contains("50 of 80 requested"))
        .stdout(predicate::str::contains("Batch cap reached"));
}
