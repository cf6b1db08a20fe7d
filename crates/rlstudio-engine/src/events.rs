//! In-process event bus.
//!
//! Producers publish named events; every handler subscribed to that name gets
//! its own FIFO queue drained by a dedicated worker task, so:
//! - `publish` never waits on a handler,
//! - each handler sees events in the order they were published,
//! - a handler that errors or panics is logged and does not affect the others.

use crate::error::EngineResult;
use crate::job::{JobId, JobStatus, MetricsSnapshot};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, warn};

/// Wire-level event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    StartTraining,
    StopTraining,
    TrainingComplete,
    MetricsUpdate,
    ProcessDataset,
    DatasetComplete,
    ProcessEvaluation,
    EvaluationComplete,
    ProcessSynthesis,
    SynthesisComplete,
}

impl EventName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartTraining => "start-training",
            Self::StopTraining => "stop-training",
            Self::TrainingComplete => "training-complete",
            Self::MetricsUpdate => "metrics-update",
            Self::ProcessDataset => "process-dataset",
            Self::DatasetComplete => "dataset-complete",
            Self::ProcessEvaluation => "process-evaluation",
            Self::EvaluationComplete => "evaluation-complete",
            Self::ProcessSynthesis => "process-synthesis",
            Self::SynthesisComplete => "synthesis-complete",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A published event: a name plus a flat JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: EventName,
    pub payload: Value,
}

impl Event {
    pub fn new<P: Serialize>(name: EventName, payload: &P) -> EngineResult<Self> {
        Ok(Self { name, payload: serde_json::to_value(payload)? })
    }

    pub fn decode<P: DeserializeOwned>(&self) -> EngineResult<P> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// String field of the payload, e.g. `jobId`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.payload.get(name).and_then(Value::as_str)
    }
}

/// Payload of `start-training` and `stop-training`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: JobId,
}

/// Payload of `training-complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingComplete {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `metrics-update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdate {
    pub job_id: JobId,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

/// Payload of `process-evaluation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessEvaluation {
    pub evaluation_id: String,
    pub model: String,
    pub judge_model: String,
    pub prompts: Vec<String>,
    pub criteria: Vec<String>,
}

/// Payload of `process-synthesis`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSynthesis {
    pub synthesis_id: String,
    pub topic: String,
    pub num_examples: u64,
    pub difficulty: String,
    pub format: String,
    pub temperature: f64,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> EngineResult<()>;
}

/// Handler backed by a closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = EngineResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> EngineResult<()> {
        (self.f)(event.clone()).await
    }
}

pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = EngineResult<()>> + Send + 'static,
{
    Arc::new(FnHandler { name: name.into(), f })
}

struct Route {
    handler: String,
    queue: mpsc::UnboundedSender<Event>,
}

/// Publish/subscribe dispatcher. Cloning shares the same routes.
#[derive(Clone, Default)]
pub struct EventBus {
    routes: Arc<RwLock<HashMap<EventName, Vec<Route>>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("event_names", &self.routes.try_read().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name` and starts its worker. Must be called inside a Tokio runtime.
    pub async fn subscribe(&self, name: EventName, handler: Arc<dyn EventHandler>) {
        let (queue, mut rx) = mpsc::unbounded_channel::<Event>();
        let handler_name = handler.name().to_string();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                deliver(handler.as_ref(), &event).await;
            }
            debug!(handler = %handler.name(), event = %name, "Event worker stopped");
        });

        debug!(handler = %handler_name, event = %name, "Subscribed handler");
        self.routes.write().await.entry(name).or_default().push(Route { handler: handler_name, queue });
    }

    /// Enqueues `event` for every subscribed handler and returns how many accepted it.
    pub async fn publish(&self, event: Event) -> usize {
        let routes = self.routes.read().await;
        let Some(targets) = routes.get(&event.name) else {
            debug!(event = %event.name, "No subscribers for event");
            return 0;
        };

        let mut delivered = 0;
        for route in targets {
            if route.queue.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!(handler = %route.handler, event = %event.name, "Event worker is gone, dropping event");
            }
        }
        delivered
    }

    /// Serializes `payload` and publishes it under `name`.
    pub async fn emit<P: Serialize + Sync>(&self, name: EventName, payload: &P) -> EngineResult<usize> {
        let event = Event::new(name, payload)?;
        Ok(self.publish(event).await)
    }

    pub async fn subscriber_count(&self, name: EventName) -> usize {
        self.routes.read().await.get(&name).map_or(0, Vec::len)
    }

    /// Drops every route. Workers drain what is already queued and exit.
    pub async fn close(&self) {
        self.routes.write().await.clear();
    }
}

async fn deliver(handler: &dyn EventHandler, event: &Event) {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => debug!(handler = %handler.name(), event = %event.name, "Event handled"),
        Ok(Err(e)) => error!(
            handler = %handler.name(),
            event = %event.name,
            error = %e,
            "Event handler failed"
        ),
        Err(_) => error!(handler = %handler.name(), event = %event.name, "Event handler panicked"),
    }
}
