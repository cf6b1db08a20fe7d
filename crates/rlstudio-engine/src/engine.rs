//! Engine facade consumed by the API and transport layers.
//!
//! Creation calls store the entity, publish the trigger event and return
//! immediately; the work itself runs on background tasks wired to the bus.

use crate::broadcast::{MetricsBroadcaster, MetricsSink, SubscriptionId};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventName, JobRef, ProcessEvaluation, ProcessSynthesis};
use crate::job::{Job, JobId, JobStatus, MetricsSnapshot, NewJob};
use crate::machine::JobRunner;
use crate::processors::StepProcessors;
use crate::records::{
    Dataset, Evaluation, ModelInfo, NewDataset, NewEvaluation, NewSynthesis, SynthesisResult,
};
use crate::store::{self, Collection, JsonFileStore, MemoryStore, Modified, StateStore, keys};
use crate::trainer::{SimulatedTrainer, Trainer};
use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of [`Engine::stop_job`]. Every variant is a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The job was running and is now `stopped`.
    Stopped,
    /// The job had already finished; nothing changed.
    AlreadyTerminal(JobStatus),
    /// The job has not started running; nothing changed.
    NotRunning,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn StateStore>,
    bus: EventBus,
    runner: Arc<JobRunner>,
    broadcaster: Arc<MetricsBroadcaster>,
    processors: Arc<StepProcessors>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("runner", &self.runner)
            .field("processors", &self.processors)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Builds the engine and subscribes its components to a fresh bus.
    /// Must be called inside a Tokio runtime.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        trainer: Arc<dyn Trainer>,
    ) -> Self {
        let bus = EventBus::new();
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&trainer),
            &config,
        ));
        let broadcaster =
            Arc::new(MetricsBroadcaster::new(Arc::clone(&store), config.max_subscribers_per_job));
        let processors = Arc::new(StepProcessors::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&trainer),
            &config,
        ));

        runner.attach(&bus).await;
        broadcaster.attach(&bus).await;
        processors.attach(&bus).await;

        info!(trainer = trainer.id(), persistent = config.store_path.is_some(), "Engine started");
        Self { config, store, bus, runner, broadcaster, processors }
    }

    /// Starts an engine with the simulated trainer, persisting to
    /// `config.store_path` when set and keeping state in memory otherwise.
    pub async fn open(config: EngineConfig) -> EngineResult<Self> {
        let store: Arc<dyn StateStore> = match &config.store_path {
            Some(path) => Arc::new(JsonFileStore::open(path).await?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::start(config, store, Arc::new(SimulatedTrainer::new())).await)
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    // Training jobs

    pub async fn create_job(&self, request: NewJob) -> EngineResult<JobId> {
        let job = Job::from_request(
            request,
            &self.config.default_hyperparams,
            self.config.default_total_steps,
        )?;
        let id = job.id.clone();

        self.store
            .insert_indexed(
                Collection::Training,
                keys::JOBS_LIST,
                &keys::job(id.as_str()),
                id.as_str(),
                serde_json::to_value(&job)?,
            )
            .await?;
        self.bus.emit(EventName::StartTraining, &JobRef { job_id: id.clone() }).await?;

        info!(job_id = %id, model = %job.model, dataset = %job.dataset, total_steps = job.total_steps, "Training job created");
        Ok(id)
    }

    pub async fn get_job(&self, job_id: &JobId) -> EngineResult<Job> {
        store::load(self.store.as_ref(), Collection::Training, &keys::job(job_id.as_str()))
            .await?
            .ok_or_else(|| EngineError::not_found("training job", job_id.as_str()))
    }

    /// Jobs in creation order, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> EngineResult<Vec<Job>> {
        let jobs: Vec<Job> =
            store::load_indexed(self.store.as_ref(), Collection::Training, keys::job).await?;
        Ok(jobs.into_iter().filter(|job| status.is_none_or(|s| job.status == s)).collect())
    }

    /// Moves a running job to `stopped`. The stored status changes before
    /// this returns; the loop notices on its next poll.
    pub async fn stop_job(&self, job_id: &JobId) -> EngineResult<StopOutcome> {
        let key = keys::job(job_id.as_str());
        let outcome = store::modify(self.store.as_ref(), Collection::Training, &key, |job: &mut Job| {
            job.transition(JobStatus::Stopped)
        })
        .await?;

        match outcome {
            Modified::Written(job) => {
                info!(job_id = %job_id, step = job.current_step, "Training job stopped");
                self.bus.emit(EventName::StopTraining, &JobRef { job_id: job_id.clone() }).await?;
                Ok(StopOutcome::Stopped)
            }
            Modified::Unchanged(job) if job.is_terminal() => {
                debug!(job_id = %job_id, status = %job.status, "Stop ignored, job already finished");
                Ok(StopOutcome::AlreadyTerminal(job.status))
            }
            Modified::Unchanged(_) => {
                debug!(job_id = %job_id, "Stop ignored, job not running yet");
                Ok(StopOutcome::NotRunning)
            }
            Modified::Missing => Err(EngineError::not_found("training job", job_id.as_str())),
        }
    }

    /// Stops, then removes the job with its index entry, metrics history and
    /// subscriptions. Returns whether the job existed.
    pub async fn delete_job(&self, job_id: &JobId) -> EngineResult<bool> {
        match self.stop_job(job_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.runner.cancel(job_id).await;

        let existed = self
            .store
            .delete_indexed(
                Collection::Training,
                keys::JOBS_LIST,
                &keys::job(job_id.as_str()),
                job_id.as_str(),
            )
            .await?;
        self.store.set(Collection::Training, &keys::metrics(job_id.as_str()), Value::Null).await?;
        let released = self.broadcaster.unsubscribe(job_id).await;

        info!(job_id = %job_id, existed, released, "Training job deleted");
        Ok(existed)
    }

    /// Recorded metrics of a job, oldest first.
    pub async fn metrics_history(&self, job_id: &JobId) -> EngineResult<Vec<MetricsSnapshot>> {
        self.get_job(job_id).await?;
        let history: Option<Vec<MetricsSnapshot>> =
            store::load(self.store.as_ref(), Collection::Training, &keys::metrics(job_id.as_str()))
                .await?;
        Ok(history.unwrap_or_default())
    }

    // Live metrics

    /// Registers `sink` for live metrics. The last-known snapshot is sent
    /// right away; see [`MetricsBroadcaster::subscribe`].
    pub async fn subscribe_metrics(
        &self,
        job_id: &JobId,
        sink: Arc<dyn MetricsSink>,
    ) -> EngineResult<Option<SubscriptionId>> {
        self.broadcaster.subscribe(job_id, sink).await
    }

    /// Drops every subscription of `job_id`.
    pub async fn unsubscribe_metrics(&self, job_id: &JobId) -> usize {
        self.broadcaster.unsubscribe(job_id).await
    }

    pub async fn unsubscribe_subscription(&self, job_id: &JobId, id: SubscriptionId) -> bool {
        self.broadcaster.unsubscribe_one(job_id, id).await
    }

    pub async fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.broadcaster.subscriber_count(job_id).await
    }

    // Step processor records

    async fn insert_record<T: Serialize + Sync>(
        &self,
        collection: Collection,
        id: &str,
        record: &T,
    ) -> EngineResult<()> {
        self.store
            .insert_indexed(collection, keys::LIST, id, id, serde_json::to_value(record)?)
            .await?;
        Ok(())
    }

    async fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        collection: Collection,
        kind: &'static str,
        id: &str,
    ) -> EngineResult<T> {
        store::load(self.store.as_ref(), collection, id)
            .await?
            .ok_or_else(|| EngineError::not_found(kind, id))
    }

    async fn list_records<T: serde::de::DeserializeOwned>(
        &self,
        collection: Collection,
    ) -> EngineResult<Vec<T>> {
        Ok(store::load_indexed(self.store.as_ref(), collection, str::to_string).await?)
    }

    pub async fn create_dataset(&self, request: NewDataset) -> EngineResult<String> {
        if request.name.trim().is_empty() {
            return Err(EngineError::InvalidRequest("dataset name is required".to_string()));
        }
        let dataset = Dataset::from_request(request);
        self.insert_record(Collection::Datasets, &dataset.id, &dataset).await?;
        self.bus.emit(EventName::ProcessDataset, &json!({ "datasetId": dataset.id })).await?;

        info!(dataset_id = %dataset.id, name = %dataset.name, "Dataset queued for processing");
        Ok(dataset.id)
    }

    pub async fn get_dataset(&self, id: &str) -> EngineResult<Dataset> {
        self.get_record(Collection::Datasets, "dataset", id).await
    }

    pub async fn list_datasets(&self) -> EngineResult<Vec<Dataset>> {
        self.list_records(Collection::Datasets).await
    }

    pub async fn create_evaluation(&self, request: NewEvaluation) -> EngineResult<String> {
        if request.model.trim().is_empty() {
            return Err(EngineError::InvalidRequest("model is required".to_string()));
        }
        if request.judge_model.trim().is_empty() {
            return Err(EngineError::InvalidRequest("judge model is required".to_string()));
        }
        let evaluation = Evaluation::from_request(request);
        self.insert_record(Collection::Evaluations, &evaluation.id, &evaluation).await?;
        self.bus
            .emit(
                EventName::ProcessEvaluation,
                &ProcessEvaluation {
                    evaluation_id: evaluation.id.clone(),
                    model: evaluation.model.clone(),
                    judge_model: evaluation.judge_model.clone(),
                    prompts: evaluation.prompts.clone(),
                    criteria: evaluation.criteria.clone(),
                },
            )
            .await?;

        info!(evaluation_id = %evaluation.id, model = %evaluation.model, "Evaluation queued");
        Ok(evaluation.id)
    }

    pub async fn get_evaluation(&self, id: &str) -> EngineResult<Evaluation> {
        self.get_record(Collection::Evaluations, "evaluation", id).await
    }

    pub async fn list_evaluations(&self) -> EngineResult<Vec<Evaluation>> {
        self.list_records(Collection::Evaluations).await
    }

    pub async fn create_synthesis(&self, request: NewSynthesis) -> EngineResult<String> {
        if request.topic.trim().is_empty() {
            return Err(EngineError::InvalidRequest("topic is required".to_string()));
        }
        if request.num_examples == 0 {
            return Err(EngineError::InvalidRequest("num_examples must be >= 1".to_string()));
        }
        let synthesis = SynthesisResult::from_request(request);
        self.insert_record(Collection::Synthesis, &synthesis.id, &synthesis).await?;
        self.bus
            .emit(
                EventName::ProcessSynthesis,
                &ProcessSynthesis {
                    synthesis_id: synthesis.id.clone(),
                    topic: synthesis.topic.clone(),
                    num_examples: synthesis.requested_examples,
                    difficulty: synthesis.difficulty.clone(),
                    format: synthesis.format.clone(),
                    temperature: synthesis.temperature,
                },
            )
            .await?;

        info!(
            synthesis_id = %synthesis.id,
            topic = %synthesis.topic,
            requested = synthesis.requested_examples,
            "Synthesis queued"
        );
        Ok(synthesis.id)
    }

    pub async fn get_synthesis(&self, id: &str) -> EngineResult<SynthesisResult> {
        self.get_record(Collection::Synthesis, "synthesis", id).await
    }

    pub async fn list_synthesis(&self) -> EngineResult<Vec<SynthesisResult>> {
        self.list_records(Collection::Synthesis).await
    }

    /// Base model catalog. An empty store is seeded with the defaults.
    pub async fn list_models(&self) -> EngineResult<Vec<ModelInfo>> {
        let models: Vec<ModelInfo> = self.list_records(Collection::Models).await?;
        if !models.is_empty() {
            return Ok(models);
        }

        let catalog = ModelInfo::default_catalog();
        for model in &catalog {
            self.insert_record(Collection::Models, &model.id, model).await?;
        }
        debug!(models = catalog.len(), "Seeded model catalog");
        Ok(catalog)
    }

    /// Interrupts every training loop (running jobs end up `failed`) and
    /// stops the bus workers.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
        self.bus.close().await;
        info!("Engine shut down");
    }
}
