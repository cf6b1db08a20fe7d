//! Training job state machine.
//!
//! Each `start-training` event spawns one task that drives a job through
//! `queued -> running -> {completed, failed, stopped}`. The store is the only
//! source of truth: before every increment the loop re-reads the job and
//! exits if it was stopped, failed or deleted underneath it, and every write
//! is a read-check-write that refuses to touch a terminal or missing record.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventName, JobRef, MetricsUpdate, TrainingComplete, handler_fn};
use crate::job::{Job, JobId, JobStatus};
use crate::store::{self, Collection, Modified, StateStore, keys};
use crate::trainer::Trainer;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Failure message for jobs cut short by [`JobRunner::shutdown`].
pub const SHUTDOWN_MESSAGE: &str = "interrupted by engine shutdown";

/// Why a job's loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Completed,
    /// The stored job left `running` (or never was `queued`) without our help.
    Halted(JobStatus),
    /// The record disappeared.
    Vanished,
    /// The engine is shutting down.
    Interrupted,
}

struct ActiveRun {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct JobRunner {
    store: Arc<dyn StateStore>,
    bus: EventBus,
    trainer: Arc<dyn Trainer>,
    step_increment: u64,
    step_delay: Duration,
    history_limit: usize,
    root: CancellationToken,
    active: RwLock<HashMap<JobId, ActiveRun>>,
}

impl fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRunner")
            .field("trainer", &self.trainer.id())
            .field("step_increment", &self.step_increment)
            .field("step_delay", &self.step_delay)
            .finish_non_exhaustive()
    }
}

impl JobRunner {
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
            step_increment: config.step_increment.max(1),
            step_delay: config.step_delay(),
            history_limit: config.metrics_history_limit,
            root: CancellationToken::new(),
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribes the runner to `start-training` and `stop-training`.
    pub async fn attach(self: &Arc<Self>, bus: &EventBus) {
        let runner = Arc::clone(self);
        bus.subscribe(
            EventName::StartTraining,
            handler_fn("job-runner.start", move |event| {
                let runner = Arc::clone(&runner);
                async move {
                    let start: JobRef = event.decode()?;
                    runner.start(start.job_id).await;
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;

        // Stop is already authoritative in the store; this only wakes the loop early.
        let runner = Arc::clone(self);
        bus.subscribe(
            EventName::StopTraining,
            handler_fn("job-runner.wake", move |event| {
                let runner = Arc::clone(&runner);
                async move {
                    let stop: JobRef = event.decode()?;
                    runner.cancel(&stop.job_id).await;
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;
    }

    /// Spawns the lifecycle task for `job_id`. Returns `false` if one is
    /// already active or the runner has been shut down.
    pub async fn start(self: &Arc<Self>, job_id: JobId) -> bool {
        if self.root.is_cancelled() {
            warn!(job_id = %job_id, "Runner is shut down, not starting job");
            return false;
        }

        let mut active = self.active.write().await;
        if active.contains_key(&job_id) {
            debug!(job_id = %job_id, "Job already has an active loop");
            return false;
        }

        let token = self.root.child_token();
        let runner = Arc::clone(self);
        let task = tokio::spawn(runner.run(job_id.clone(), token.clone()));
        active.insert(job_id, ActiveRun { token, task });
        true
    }

    /// Wakes the job's loop so it re-reads the store without waiting out the
    /// step delay. Returns whether a loop was active.
    pub async fn cancel(&self, job_id: &JobId) -> bool {
        let active = self.active.read().await;
        match active.get(job_id) {
            Some(run) => {
                debug!(job_id = %job_id, "Waking training loop");
                run.token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, job_id: &JobId) -> bool {
        self.active.read().await.contains_key(job_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Cancels every loop and waits for them to record their final state.
    /// Jobs still running are marked failed.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let runs: Vec<(JobId, ActiveRun)> = self.active.write().await.drain().collect();
        info!(jobs = runs.len(), "Shutting down training loops");
        for (job_id, run) in runs {
            if let Err(e) = run.task.await {
                error!(job_id = %job_id, error = %e, "Training task aborted");
            }
        }
    }

    async fn run(self: Arc<Self>, job_id: JobId, token: CancellationToken) {
        match self.drive(&job_id, &token).await {
            Ok(Exit::Completed) => info!(job_id = %job_id, "Training completed"),
            Ok(Exit::Halted(status)) => {
                info!(job_id = %job_id, status = %status, "Training loop exited");
            }
            Ok(Exit::Vanished) => {
                info!(job_id = %job_id, "Job deleted, training loop exited");
                // History appended after the delete's tombstone would be orphaned.
                let key = keys::metrics(job_id.as_str());
                if let Err(e) = self.store.set(Collection::Training, &key, Value::Null).await {
                    warn!(job_id = %job_id, error = %e, "Could not clear metrics history");
                }
            }
            Ok(Exit::Interrupted) => {
                warn!(job_id = %job_id, "Training interrupted by shutdown");
                self.fail(&job_id, SHUTDOWN_MESSAGE).await;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Training failed");
                self.fail(&job_id, &e.to_string()).await;
            }
        }

        self.active.write().await.remove(&job_id);
    }

    async fn drive(&self, job_id: &JobId, token: &CancellationToken) -> EngineResult<Exit> {
        let key = keys::job(job_id.as_str());
        let store = self.store.as_ref();

        let Some(job) = store::load::<Job>(store, Collection::Training, &key).await? else {
            return Ok(Exit::Vanished);
        };
        if job.status != JobStatus::Queued {
            return Ok(Exit::Halted(job.status));
        }

        let gauges = self.trainer.warm_up(&job).await?;
        let job = match store::modify(store, Collection::Training, &key, |job: &mut Job| {
            let started = job.transition(JobStatus::Running);
            if started {
                job.apply_gauges(gauges);
            }
            started
        })
        .await?
        {
            Modified::Written(job) => job,
            Modified::Unchanged(job) => return Ok(Exit::Halted(job.status)),
            Modified::Missing => return Ok(Exit::Vanished),
        };
        info!(job_id = %job_id, total_steps = job.total_steps, trainer = self.trainer.id(), "Training started");

        let mut step = job.current_step;
        while step < job.total_steps {
            // A cancelled token wakes the loop once; later delays run in full.
            tokio::select! {
                () = tokio::time::sleep(self.step_delay) => {}
                () = token.cancelled(), if !token.is_cancelled() => {}
            }
            if self.root.is_cancelled() {
                return Ok(Exit::Interrupted);
            }

            let Some(current) = store::load::<Job>(store, Collection::Training, &key).await? else {
                return Ok(Exit::Vanished);
            };
            if current.status != JobStatus::Running {
                return Ok(Exit::Halted(current.status));
            }

            let next = (step + self.step_increment).min(current.total_steps);
            let sample = tokio::select! {
                sample = self.trainer.step(&current, next) => sample?,
                () = self.root.cancelled() => return Ok(Exit::Interrupted),
            };
            let written = match store::modify(store, Collection::Training, &key, |job: &mut Job| {
                if job.status != JobStatus::Running {
                    return false;
                }
                job.record_step(next, sample);
                true
            })
            .await?
            {
                Modified::Written(job) => job,
                Modified::Unchanged(job) => return Ok(Exit::Halted(job.status)),
                Modified::Missing => return Ok(Exit::Vanished),
            };

            step = written.current_step;
            debug!(job_id = %job_id, step, total = written.total_steps, loss = written.loss, "Step recorded");
            self.publish_metrics(&written).await?;
        }

        match store::modify(store, Collection::Training, &key, |job: &mut Job| {
            job.transition(JobStatus::Completed)
        })
        .await?
        {
            Modified::Written(job) => {
                self.bus
                    .emit(
                        EventName::TrainingComplete,
                        &TrainingComplete { job_id: job.id, status: JobStatus::Completed, error: None },
                    )
                    .await?;
                Ok(Exit::Completed)
            }
            Modified::Unchanged(job) => Ok(Exit::Halted(job.status)),
            Modified::Missing => Ok(Exit::Vanished),
        }
    }

    /// Appends the job's snapshot to its history, then publishes it. Runs only
    /// after the job record itself has been written.
    async fn publish_metrics(&self, job: &Job) -> EngineResult<()> {
        let Some(metrics) = job.metrics_snapshot() else {
            return Ok(());
        };

        if self.history_limit > 0 {
            let limit = self.history_limit;
            let point = serde_json::to_value(&metrics)?;
            self.store
                .update(
                    Collection::Training,
                    &keys::metrics(job.id.as_str()),
                    Box::new(move |current| {
                        let mut points = current.and_then(Value::as_array).cloned().unwrap_or_default();
                        points.push(point);
                        if points.len() > limit {
                            let excess = points.len() - limit;
                            points.drain(..excess);
                        }
                        Some(Value::Array(points))
                    }),
                )
                .await?;
        }

        self.bus
            .emit(EventName::MetricsUpdate, &MetricsUpdate { job_id: job.id.clone(), metrics })
            .await?;
        Ok(())
    }

    /// Moves a non-terminal job to `failed` and announces it.
    async fn fail(&self, job_id: &JobId, message: &str) {
        let key = keys::job(job_id.as_str());
        let outcome = store::modify(self.store.as_ref(), Collection::Training, &key, |job: &mut Job| {
            if !job.transition(JobStatus::Failed) {
                return false;
            }
            job.error = Some(message.to_string());
            true
        })
        .await;

        match outcome {
            Ok(Modified::Written(_)) => {
                let event = TrainingComplete {
                    job_id: job_id.clone(),
                    status: JobStatus::Failed,
                    error: Some(message.to_string()),
                };
                if let Err(e) = self.bus.emit(EventName::TrainingComplete, &event).await {
                    error!(job_id = %job_id, error = %e, "Could not publish failure");
                }
            }
            Ok(Modified::Unchanged(job)) => {
                debug!(job_id = %job_id, status = %job.status, "Job already terminal, not failing it");
            }
            Ok(Modified::Missing) => debug!(job_id = %job_id, "Job gone, nothing to fail"),
            Err(e) => error!(job_id = %job_id, error = %e, "Could not record job failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{HyperParams, NewJob, RuntimeGauges, StepSample};
    use crate::records::{Dataset, Evaluation, SynthesisResult, SyntheticExample};
    use crate::store::MemoryStore;
    use crate::trainer::{DatasetSummary, Judgement, SimulatedTrainer};
    use async_trait::async_trait;

    struct BrokenTrainer;

    #[async_trait]
    impl Trainer for BrokenTrainer {
        fn id(&self) -> &'static str {
            "broken"
        }

        async fn warm_up(&self, _job: &Job) -> EngineResult<RuntimeGauges> {
            Ok(RuntimeGauges::default())
        }

        async fn step(&self, _job: &Job, step: u64) -> EngineResult<StepSample> {
            if step > 20 {
                return Err(EngineError::ProcessingFailure("device lost".to_string()));
            }
            Ok(StepSample::default())
        }

        async fn ingest(&self, _dataset: &Dataset) -> EngineResult<DatasetSummary> {
            unreachable!()
        }

        async fn judge(&self, _evaluation: &Evaluation, _max: usize) -> EngineResult<Judgement> {
            unreachable!()
        }

        async fn synthesize(
            &self,
            _request: &SynthesisResult,
            _count: usize,
        ) -> EngineResult<Vec<SyntheticExample>> {
            unreachable!()
        }
    }

    fn config() -> EngineConfig {
        EngineConfig { step_increment: 20, step_delay_ms: 1, ..EngineConfig::default() }
    }

    async fn queued(store: &MemoryStore, total_steps: u64) -> Job {
        let job = Job::from_request(
            NewJob::new("gpt2-small", "python-code").with_total_steps(total_steps),
            &HyperParams::default(),
            total_steps,
        )
        .unwrap();
        store::save(store, Collection::Training, &keys::job(job.id.as_str()), &job).await.unwrap();
        job
    }

    async fn wait_terminal(store: &MemoryStore, job_id: &JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let job: Job = store::load(store, Collection::Training, &keys::job(job_id.as_str()))
                    .await
                    .unwrap()
                    .unwrap();
                if job.is_terminal() {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("job should reach a terminal state")
    }

    #[tokio::test]
    async fn test_job_runs_to_completion_with_history() {
        let store = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            bus,
            Arc::new(SimulatedTrainer::with_seed(11)),
            &config(),
        ));
        let job = queued(&store, 100).await;

        assert!(runner.start(job.id.clone()).await);
        let done = wait_terminal(&store, &job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.current_step, 100);
        assert_eq!(done.progress, 100);
        assert!(done.start_time.is_some());
        assert!(done.end_time.is_some());

        let history = store.get(Collection::Training, &keys::metrics(job.id.as_str())).await.unwrap().unwrap();
        let steps: Vec<u64> = history
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["step"].as_u64().unwrap())
            .collect();
        assert_eq!(steps, vec![20, 40, 60, 80, 100]);
    }

    #[tokio::test]
    async fn test_trainer_error_fails_job() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            EventBus::new(),
            Arc::new(BrokenTrainer),
            &config(),
        ));
        let job = queued(&store, 100).await;

        runner.start(job.id.clone()).await;
        let done = wait_terminal(&store, &job.id).await;

        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.current_step, 20);
        assert!(done.error.unwrap().contains("device lost"));
        assert!(done.end_time.is_some());
    }

    #[tokio::test]
    async fn test_non_queued_job_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            EventBus::new(),
            Arc::new(SimulatedTrainer::new()),
            &config(),
        ));
        let mut job = queued(&store, 100).await;
        job.transition(JobStatus::Failed);
        store::save(store.as_ref(), Collection::Training, &keys::job(job.id.as_str()), &job)
            .await
            .unwrap();

        runner.start(job.id.clone()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let after: Job = store::load(store.as_ref(), Collection::Training, &keys::job(job.id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after, job);
        assert!(!runner.is_active(&job.id).await);
    }

    #[tokio::test]
    async fn test_shutdown_marks_running_jobs_failed() {
        let store = Arc::new(MemoryStore::new());
        let slow = EngineConfig { step_increment: 1, step_delay_ms: 50, ..EngineConfig::default() };
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            EventBus::new(),
            Arc::new(SimulatedTrainer::new()),
            &slow,
        ));
        let job = queued(&store, 1000).await;
        runner.start(job.id.clone()).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        runner.shutdown().await;
        let done: Job = store::load(store.as_ref(), Collection::Training, &keys::job(job.id.as_str()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.error.as_deref(), Some(SHUTDOWN_MESSAGE));
        assert!(!runner.start(JobId::new()).await);
    }
}
