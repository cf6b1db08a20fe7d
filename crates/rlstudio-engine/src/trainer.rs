//! Source of metric values and derived work.
//!
//! The engine owns state transitions, events and broadcasting; a [`Trainer`]
//! only computes numbers and payloads. [`SimulatedTrainer`] is the built-in
//! placeholder backend that produces a plausible random walk.

use crate::error::EngineResult;
use crate::job::{Job, RuntimeGauges, StepSample};
use crate::records::{
    CriteriaScores, Dataset, Evaluation, JudgedExample, SynthesisResult, SyntheticExample,
};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Mutex, PoisonError};

/// Result of ingesting a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSummary {
    pub examples: u64,
    pub size_bytes: u64,
}

/// Result of judging a model.
#[derive(Debug, Clone, PartialEq)]
pub struct Judgement {
    pub overall_score: f64,
    pub scores: CriteriaScores,
    pub examples: Vec<JudgedExample>,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    fn id(&self) -> &'static str;

    /// Gauges the job starts with when it enters `running`.
    async fn warm_up(&self, job: &Job) -> EngineResult<RuntimeGauges>;

    /// Metrics for `job` having reached `step`.
    async fn step(&self, job: &Job, step: u64) -> EngineResult<StepSample>;

    async fn ingest(&self, dataset: &Dataset) -> EngineResult<DatasetSummary>;

    /// Judges at most `max_examples` of the evaluation's prompts.
    async fn judge(&self, evaluation: &Evaluation, max_examples: usize) -> EngineResult<Judgement>;

    /// Generates exactly `count` examples for the request.
    async fn synthesize(
        &self,
        request: &SynthesisResult,
        count: usize,
    ) -> EngineResult<Vec<SyntheticExample>>;
}

/// Random-walk trainer standing in for a real backend.
#[derive(Debug)]
pub struct SimulatedTrainer {
    rng: Mutex<StdRng>,
}

impl SimulatedTrainer {
    #[must_use]
    pub fn new() -> Self {
        Self { rng: Mutex::new(StdRng::from_entropy()) }
    }

    /// Reproducible sequence, for tests and demos.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

impl Default for SimulatedTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Trainer for SimulatedTrainer {
    fn id(&self) -> &'static str {
        "simulated"
    }

    async fn warm_up(&self, _job: &Job) -> EngineResult<RuntimeGauges> {
        Ok(self.with_rng(|rng| RuntimeGauges {
            tokens_per_second: f64::from(rng.gen_range(500u32..2000)),
            gpu_utilization: f64::from(rng.gen_range(70u32..95)),
            memory_usage: f64::from(rng.gen_range(50u32..80)),
        }))
    }

    async fn step(&self, job: &Job, step: u64) -> EngineResult<StepSample> {
        let fraction = step as f64 / job.total_steps.max(1) as f64;
        Ok(self.with_rng(|rng| StepSample {
            loss: (2.0f64.mul_add(1.0 - fraction, rng.gen_range(-0.05..0.05))).max(0.1),
            reward: (0.6f64.mul_add(fraction, 0.3) + rng.gen_range(-0.02..0.02)).min(1.0),
            kl_divergence: (0.1f64.mul_add(1.0 - fraction, rng.gen_range(-0.005..0.005))).max(0.01),
            gauges: RuntimeGauges {
                tokens_per_second: f64::from(rng.gen_range(1000u32..1300)),
                gpu_utilization: f64::from(rng.gen_range(75u32..90)),
                memory_usage: f64::from(rng.gen_range(60u32..80)),
            },
        }))
    }

    async fn ingest(&self, _dataset: &Dataset) -> EngineResult<DatasetSummary> {
        Ok(self.with_rng(|rng| DatasetSummary {
            examples: rng.gen_range(1000..50_000),
            size_bytes: rng.gen_range(1_048_576..10_485_760),
        }))
    }

    async fn judge(&self, evaluation: &Evaluation, max_examples: usize) -> EngineResult<Judgement> {
        Ok(self.with_rng(|rng| {
            let examples = evaluation
                .prompts
                .iter()
                .take(max_examples)
                .enumerate()
                .map(|(index, prompt)| JudgedExample {
                    prompt: prompt.clone(),
                    response: format!(
                        "Simulated response to: {}...",
                        prompt.chars().take(50).collect::<String>()
                    ),
                    score: rng.gen_range(7.0..10.0),
                    feedback: format!("Simulated feedback for response {}.", index + 1),
                })
                .collect();
            Judgement {
                overall_score: rng.gen_range(7.0..10.0),
                scores: CriteriaScores {
                    helpfulness: rng.gen_range(7.0..10.0),
                    accuracy: rng.gen_range(7.0..10.0),
                    safety: rng.gen_range(8.0..10.0),
                    clarity: rng.gen_range(6.0..9.0),
                    completeness: rng.gen_range(6.0..9.0),
                },
                examples,
            }
        }))
    }

    async fn synthesize(
        &self,
        request: &SynthesisResult,
        count: usize,
    ) -> EngineResult<Vec<SyntheticExample>> {
        Ok((1..=count)
            .map(|i| SyntheticExample {
                prompt: format!(
                    "Explain {} concept {} in {} difficulty level",
                    request.topic, i, request.difficulty
                ),
                response: format!(
                    "Synthetic content about {} at {} level.",
                    request.topic, request.difficulty
                ),
                topic: request.topic.clone(),
                difficulty: request.difficulty.clone(),
            })
            .collect())
    }
}
