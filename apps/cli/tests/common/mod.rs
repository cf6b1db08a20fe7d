#![allow(dead_code)]

use assert_cmd::Command;
use std::path::Path;

/// `rlstudio` running in `dir` with delays short enough for tests.
pub fn rlstudio(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("rlstudio").unwrap();
    cmd.current_dir(dir)
        .env_remove("RUST_LOG")
        .env_remove("RLSTUDIO_STORE_PATH")
        .env("RLSTUDIO_STEP_DELAY_MS", "1")
        .env("RLSTUDIO_PROCESSING_DELAY_MS", "1")
        .timeout(std::time::Duration::from_secs(30));
    cmd
}

/// Runs `cmd`, asserts success and parses stdout as JSON.
pub fn json_output(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

pub fn steps(metrics: &serde_json::Value) -> Vec<u64> {
    metrics.as_array().unwrap().iter().map(|m| m["step"].as_u64().unwrap()).collect()
}
