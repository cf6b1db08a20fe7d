//! CLI command implementations.

pub mod evaluate;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod synthesize;
pub mod train;

use anyhow::Result;
use rlstudio_engine::EngineResult;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// How often record status is re-read while waiting for a processor.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Re-reads a record until `done` accepts it.
pub(crate) async fn wait_for<T, F, Fut>(mut fetch: F, done: impl Fn(&T) -> bool) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    loop {
        let record = fetch().await?;
        if done(&record) {
            return Ok(record);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
