//! RL Studio Engine
//!
//! Asynchronous orchestration of training jobs and auxiliary work:
//! - Namespaced state store with list indexes (`StateStore`)
//! - In-process event bus with per-handler FIFO delivery (`EventBus`)
//! - Training job state machine with cooperative cancellation (`JobRunner`)
//! - One-shot dataset / evaluation / synthesis processors (`StepProcessors`)
//! - Live metrics fan-out to transport sinks (`MetricsBroadcaster`)
//!
//! Metric values come from an injectable [`Trainer`]; [`Engine`] wires the
//! pieces together behind the API consumed by callers.

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod machine;
pub mod processors;
pub mod records;
pub mod store;
pub mod trainer;

pub use broadcast::{ChannelSink, MetricsBroadcaster, MetricsSink, SinkError, SubscriptionId, channel_sink};
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use engine::{Engine, StopOutcome};
pub use error::{EngineError, EngineResult};
pub use events::{Event, EventBus, EventHandler, EventName, handler_fn};
pub use job::{HyperParams, Job, JobId, JobStatus, MetricsSnapshot, NewJob, RuntimeGauges, StepSample};
pub use machine::JobRunner;
pub use processors::{ProcessorKind, StepProcessors};
pub use records::{
    Dataset, Evaluation, ModelInfo, NewDataset, NewEvaluation, NewSynthesis, ProcessingStatus, SynthesisResult,
};
pub use store::{Collection, JsonFileStore, MemoryStore, StateStore, StoreError};
pub use trainer::{DatasetSummary, Judgement, SimulatedTrainer, Trainer};
