//! One-shot step processors for datasets, evaluations and synthesis.
//!
//! A processor picks up its trigger event, performs a single unit of work
//! through the [`Trainer`], writes the terminal result and publishes a
//! completion event. A record is moved out of `processing` exactly once:
//! failures land in `error` with a message instead of leaving it stuck.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventName, handler_fn};
use crate::records::{Dataset, Evaluation, ProcessedRecord, ProcessingStatus, SynthesisResult, format_bytes};
use crate::store::{self, Collection, Modified, StateStore};
use crate::trainer::Trainer;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorKind {
    Dataset,
    Evaluation,
    Synthesis,
}

impl ProcessorKind {
    pub const ALL: [Self; 3] = [Self::Dataset, Self::Evaluation, Self::Synthesis];

    #[must_use]
    pub const fn trigger(self) -> EventName {
        match self {
            Self::Dataset => EventName::ProcessDataset,
            Self::Evaluation => EventName::ProcessEvaluation,
            Self::Synthesis => EventName::ProcessSynthesis,
        }
    }

    #[must_use]
    pub const fn completion(self) -> EventName {
        match self {
            Self::Dataset => EventName::DatasetComplete,
            Self::Evaluation => EventName::EvaluationComplete,
            Self::Synthesis => EventName::SynthesisComplete,
        }
    }

    #[must_use]
    pub const fn collection(self) -> Collection {
        match self {
            Self::Dataset => Collection::Datasets,
            Self::Evaluation => Collection::Evaluations,
            Self::Synthesis => Collection::Synthesis,
        }
    }

    /// Payload field carrying the record id.
    #[must_use]
    pub const fn id_field(self) -> &'static str {
        match self {
            Self::Dataset => "datasetId",
            Self::Evaluation => "evaluationId",
            Self::Synthesis => "synthesisId",
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Dataset => "dataset",
            Self::Evaluation => "evaluation",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for ProcessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

pub struct StepProcessors {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    trainer: Arc<dyn Trainer>,
    processing_delay: Duration,
    synthesis_batch_cap: u64,
    evaluation_example_cap: usize,
}

impl fmt::Debug for StepProcessors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepProcessors")
            .field("trainer", &self.trainer.id())
            .field("processing_delay", &self.processing_delay)
            .finish_non_exhaustive()
    }
}

impl StepProcessors {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: EventBus,
        trainer: Arc<dyn Trainer>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            trainer,
            processing_delay: config.processing_delay(),
            synthesis_batch_cap: config.synthesis_batch_cap.max(1),
            evaluation_example_cap: config.evaluation_example_cap,
        }
    }

    /// Subscribes one handler per processor kind. Each trigger spawns its own
    /// task so long work units never queue behind each other.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        for kind in ProcessorKind::ALL {
            let processors = Arc::clone(self);
            bus.subscribe(
                kind.trigger(),
                handler_fn(format!("processor.{kind}"), move |event| {
                    let processors = Arc::clone(&processors);
                    async move {
                        let id = event
                            .field(kind.id_field())
                            .ok_or_else(|| {
                                EngineError::InvalidRequest(format!(
                                    "{} payload is missing {}",
                                    event.name,
                                    kind.id_field()
                                ))
                            })?
                            .to_string();
                        tokio::spawn(async move {
                            if let Err(e) = processors.process(kind, &id).await {
                                error!(kind = %kind, id = %id, error = %e, "Processor could not record result");
                            }
                        });
                        Ok::<(), EngineError>(())
                    }
                }),
            )
            .await;
        }
    }

    /// Runs the unit of work for `id` and publishes the completion event.
    ///
    /// Returns the terminal status written, or `None` if the record was
    /// missing or already finished.
    pub async fn process(&self, kind: ProcessorKind, id: &str) -> EngineResult<Option<ProcessingStatus>> {
        tokio::time::sleep(self.processing_delay).await;
        debug!(kind = %kind, id = %id, "Processing record");

        let status = match kind {
            ProcessorKind::Dataset => self.ingest(id).await?,
            ProcessorKind::Evaluation => self.evaluate(id).await?,
            ProcessorKind::Synthesis => self.synthesize(id).await?,
        };

        let Some(status) = status else {
            debug!(kind = %kind, id = %id, "Record missing or already finished, skipping");
            return Ok(None);
        };

        let mut payload = Map::new();
        payload.insert(kind.id_field().to_string(), Value::String(id.to_string()));
        payload.insert("status".to_string(), Value::String(status.as_str().to_string()));
        self.bus.emit(kind.completion(), &Value::Object(payload)).await?;

        match status {
            ProcessingStatus::Error => warn!(kind = %kind, id = %id, "Processing failed"),
            _ => info!(kind = %kind, id = %id, status = %status, "Processing finished"),
        }
        Ok(Some(status))
    }

    async fn pending<R: ProcessedRecord>(&self, kind: ProcessorKind, id: &str) -> EngineResult<Option<R>> {
        let record: Option<R> = store::load(self.store.as_ref(), kind.collection(), id).await?;
        Ok(record.filter(|r| r.status() == ProcessingStatus::Processing))
    }

    /// Writes the outcome if the record is still `processing`.
    async fn commit<R, F>(
        &self,
        kind: ProcessorKind,
        id: &str,
        outcome: EngineResult<F>,
    ) -> EngineResult<Option<ProcessingStatus>>
    where
        R: ProcessedRecord,
        F: FnOnce(&mut R) + Send,
    {
        let written = store::modify(self.store.as_ref(), kind.collection(), id, |record: &mut R| {
            if record.status() != ProcessingStatus::Processing {
                return false;
            }
            match outcome {
                Ok(apply) => apply(record),
                Err(e) => record.fail(e.to_string()),
            }
            true
        })
        .await?;

        Ok(match written {
            Modified::Written(record) => Some(record.status()),
            Modified::Unchanged(_) | Modified::Missing => None,
        })
    }

    async fn ingest(&self, id: &str) -> EngineResult<Option<ProcessingStatus>> {
        let kind = ProcessorKind::Dataset;
        let Some(dataset) = self.pending::<Dataset>(kind, id).await? else {
            return Ok(None);
        };

        let outcome = self.trainer.ingest(&dataset).await.map(|summary| {
            move |record: &mut Dataset| {
                record.examples = summary.examples;
                record.size = format_bytes(summary.size_bytes);
                record.status = ProcessingStatus::Ready;
            }
        });
        self.commit::<Dataset, _>(kind, id, outcome).await
    }

    async fn evaluate(&self, id: &str) -> EngineResult<Option<ProcessingStatus>> {
        let kind = ProcessorKind::Evaluation;
        let Some(evaluation) = self.pending::<Evaluation>(kind, id).await? else {
            return Ok(None);
        };

        let cap = self.evaluation_example_cap;
        let outcome = self.trainer.judge(&evaluation, cap).await.map(|mut judgement| {
            judgement.examples.truncate(cap);
            move |record: &mut Evaluation| {
                record.overall_score = Some(judgement.overall_score);
                record.scores = Some(judgement.scores);
                record.examples = judgement.examples;
                record.status = ProcessingStatus::Ready;
            }
        });
        self.commit::<Evaluation, _>(kind, id, outcome).await
    }

    async fn synthesize(&self, id: &str) -> EngineResult<Option<ProcessingStatus>> {
        let kind = ProcessorKind::Synthesis;
        let Some(request) = self.pending::<SynthesisResult>(kind, id).await? else {
            return Ok(None);
        };

        let count = usize::try_from(request.requested_examples.min(self.synthesis_batch_cap))
            .map_err(|e| EngineError::InvalidRequest(e.to_string()))?;
        let outcome = self.trainer.synthesize(&request, count).await.map(|mut examples| {
            examples.truncate(count);
            move |record: &mut SynthesisResult| {
                record.num_examples = examples.len() as u64;
                record.examples = examples;
                record.status = ProcessingStatus::Ready;
            }
        });
        self.commit::<SynthesisResult, _>(kind, id, outcome).await
    }
}
