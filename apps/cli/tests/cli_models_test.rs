//! Integration tests for the models command.

mod common;

use common::{json_output, rlstudio};
use predicates::prelude::*;

#[test]
fn test_models_list() {
    let dir = tempfile::tempdir().unwrap();
    rlstudio(dir.path())
        .arg("models")
        .assert()
        .success()
        .stdout(predicate::str::contains("Base Models (4)"))
        .stdout(predicate::str::contains("llama-2-7b"));
}

#[test]
fn test_models_list_json() {
    let dir = tempfile::tempdir().unwrap();
    let models = json_output(rlstudio(dir.path()).args(["models", "--json"]));
    let ids: Vec<&str> = models.as_array().unwrap().iter().map(|m| m["id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["gpt2-small", "gpt2-medium", "gpt2-large", "llama-2-7b"]);
}

#[test]
fn test_log_level_flag_is_global() {
    let dir = tempfile::tempdir().unwrap();
    rlstudio(dir.path())
        .args(["models", "--log-level", "debug", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Engine started"));
}
