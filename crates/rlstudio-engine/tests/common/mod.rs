//! Shared helpers for engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use rlstudio_engine::records::SyntheticExample;
use rlstudio_engine::{
    Dataset, DatasetSummary, Engine, EngineConfig, EngineError, EngineResult, Evaluation, Event, EventName, Job, JobId,
    Judgement, MemoryStore, RuntimeGauges, SimulatedTrainer, StateStore, StepSample, SynthesisResult, Trainer,
    handler_fn,
};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

/// Small steps and short delays so scenarios finish in milliseconds.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        step_increment: 25,
        step_delay_ms: 5,
        default_total_steps: 100,
        processing_delay_ms: 5,
        ..EngineConfig::default()
    }
}

pub async fn start_engine(trainer: Arc<dyn Trainer>) -> (Engine, Arc<MemoryStore>) {
    start_engine_with(fast_config(), trainer).await
}

pub async fn start_engine_with(config: EngineConfig, trainer: Arc<dyn Trainer>) -> (Engine, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::start(config, Arc::clone(&store) as Arc<dyn StateStore>, trainer).await;
    (engine, store)
}

/// Polls `check` until it yields a value, failing the test after [`WAIT`].
pub async fn eventually<T, F, Fut>(mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

pub async fn wait_for_job(engine: &Engine, job_id: &JobId, done: impl Fn(&Job) -> bool) -> Job {
    let done = &done;
    eventually(move || async move {
        let job = engine.get_job(job_id).await.unwrap();
        done(&job).then_some(job)
    })
    .await
}

pub async fn wait_terminal(engine: &Engine, job_id: &JobId) -> Job {
    wait_for_job(engine, job_id, Job::is_terminal).await
}

/// Forwards every `name` event published on the engine's bus.
pub async fn capture(engine: &Engine, name: EventName) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine
        .bus()
        .subscribe(
            name,
            handler_fn(format!("test.capture.{name}"), move |event| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(event);
                    Ok::<(), EngineError>(())
                }
            }),
        )
        .await;
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv()).await.expect("no event in time").expect("bus closed")
}

/// Simulated trainer that blocks every step past `open_until` until
/// [`GatedTrainer::open`] is called, and records the steps it was asked for.
pub struct GatedTrainer {
    inner: SimulatedTrainer,
    open_until: u64,
    gate: Semaphore,
    requested: Mutex<Vec<u64>>,
}

impl GatedTrainer {
    pub fn new(open_until: u64) -> Self {
        Self {
            inner: SimulatedTrainer::with_seed(42),
            open_until,
            gate: Semaphore::new(0),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    pub fn requested(&self) -> Vec<u64> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl Trainer for GatedTrainer {
    fn id(&self) -> &'static str {
        "gated"
    }

    async fn warm_up(&self, job: &Job) -> EngineResult<RuntimeGauges> {
        self.inner.warm_up(job).await
    }

    async fn step(&self, job: &Job, step: u64) -> EngineResult<StepSample> {
        self.requested.lock().unwrap().push(step);
        if step > self.open_until {
            let _permit = self.gate.acquire().await.map_err(|e| EngineError::ProcessingFailure(e.to_string()))?;
        }
        self.inner.step(job, step).await
    }

    async fn ingest(&self, dataset: &Dataset) -> EngineResult<DatasetSummary> {
        self.inner.ingest(dataset).await
    }

    async fn judge(&self, evaluation: &Evaluation, max_examples: usize) -> EngineResult<Judgement> {
        self.inner.judge(evaluation, max_examples).await
    }

    async fn synthesize(&self, request: &SynthesisResult, count: usize) -> EngineResult<Vec<SyntheticExample>> {
        self.inner.synthesize(request, count).await
    }
}

/// Trainer whose every unit of work fails.
pub struct FailingTrainer;

#[async_trait]
impl Trainer for FailingTrainer {
    fn id(&self) -> &'static str {
        "failing"
    }

    async fn warm_up(&self, _job: &Job) -> EngineResult<RuntimeGauges> {
        Ok(RuntimeGauges::default())
    }

    async fn step(&self, _job: &Job, _step: u64) -> EngineResult<StepSample> {
        Err(EngineError::ProcessingFailure("out of memory".to_string()))
    }

    async fn ingest(&self, _dataset: &Dataset) -> EngineResult<DatasetSummary> {
        Err(EngineError::ProcessingFailure("unreadable file".to_string()))
    }

    async fn judge(&self, _evaluation: &Evaluation, _max_examples: usize) -> EngineResult<Judgement> {
        Err(EngineError::ProcessingFailure("judge timed out".to_string()))
    }

    async fn synthesize(&self, _request: &SynthesisResult, _count: usize) -> EngineResult<Vec<SyntheticExample>> {
        Err(EngineError::ProcessingFailure("generator offline".to_string()))
    }
}
