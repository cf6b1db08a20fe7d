use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier for a training job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Lifecycle status of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Checks if the job can move to `to`.
    ///
    /// `queued -> running -> {completed, failed, stopped}`; terminal states are final.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Queued, Self::Running | Self::Failed)
                | (Self::Running, Self::Completed | Self::Failed | Self::Stopped)
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(EngineError::InvalidRequest(format!("unknown job status '{other}'"))),
        }
    }
}

/// Hyperparameters captured when the job is created. Never mutated afterwards.
///
/// Serialized camelCase; snake_case keys are accepted on input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HyperParams {
    #[serde(alias = "learning_rate")]
    pub learning_rate: f64,
    #[serde(alias = "batch_size")]
    pub batch_size: u32,
    pub epochs: u32,
    #[serde(rename = "useGRPO", alias = "use_grpo")]
    pub use_grpo: bool,
}

impl Default for HyperParams {
    fn default() -> Self {
        Self { learning_rate: 1e-5, batch_size: 4, epochs: 3, use_grpo: true }
    }
}

impl HyperParams {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(EngineError::InvalidRequest("learning_rate must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(EngineError::InvalidRequest("batch_size must be >= 1".to_string()));
        }
        if self.epochs == 0 {
            return Err(EngineError::InvalidRequest("epochs must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// Request accepted by `Engine::create_job`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    #[serde(default)]
    pub name: Option<String>,
    pub model: String,
    pub dataset: String,
    /// Falls back to the engine's configured default when absent.
    #[serde(default)]
    pub hyperparams: Option<HyperParams>,
    #[serde(default)]
    pub total_steps: Option<u64>,
    /// Extra request options kept verbatim on the job.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl NewJob {
    pub fn new(model: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self { model: model.into(), dataset: dataset.into(), ..Self::default() }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_total_steps(mut self, total_steps: u64) -> Self {
        self.total_steps = Some(total_steps);
        self
    }

    #[must_use]
    pub fn with_hyperparams(mut self, hyperparams: HyperParams) -> Self {
        self.hyperparams = Some(hyperparams);
        self
    }
}

/// Runtime gauges sampled while a job runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeGauges {
    pub tokens_per_second: f64,
    pub gpu_utilization: f64,
    pub memory_usage: f64,
}

/// Scalar training metrics produced for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSample {
    pub loss: f64,
    pub reward: f64,
    pub kl_divergence: f64,
    #[serde(flatten)]
    pub gauges: RuntimeGauges,
}

/// Live metrics payload delivered to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub step: u64,
    pub loss: f64,
    pub reward: f64,
    pub kl_divergence: f64,
    pub learning_rate: f64,
    pub tokens_per_second: f64,
    pub gpu_utilization: f64,
    pub memory_usage: f64,
    pub timestamp: DateTime<Utc>,
}

/// One training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub model: String,
    pub dataset: String,
    pub status: JobStatus,
    /// Percentage of `total_steps` reached, 0-100.
    pub progress: u8,
    pub current_step: u64,
    pub total_steps: u64,
    pub loss: f64,
    pub reward: f64,
    pub kl_divergence: f64,
    pub tokens_per_second: f64,
    pub gpu_utilization: f64,
    pub memory_usage: f64,
    pub hyperparams: HyperParams,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub config: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    /// Builds a `queued` job from a validated request.
    pub fn from_request(
        request: NewJob,
        default_hyperparams: &HyperParams,
        default_total_steps: u64,
    ) -> EngineResult<Self> {
        if request.model.trim().is_empty() {
            return Err(EngineError::InvalidRequest("model is required".to_string()));
        }
        if request.dataset.trim().is_empty() {
            return Err(EngineError::InvalidRequest("dataset is required".to_string()));
        }
        let total_steps = request.total_steps.unwrap_or(default_total_steps);
        if total_steps == 0 {
            return Err(EngineError::InvalidRequest("total_steps must be >= 1".to_string()));
        }
        let hyperparams = request.hyperparams.unwrap_or_else(|| default_hyperparams.clone());
        hyperparams.validate()?;

        Ok(Self {
            id: JobId::new(),
            name: request
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Untitled Training Job".to_string()),
            model: request.model,
            dataset: request.dataset,
            status: JobStatus::Queued,
            progress: 0,
            current_step: 0,
            total_steps,
            loss: 0.0,
            reward: 0.0,
            kl_divergence: 0.0,
            tokens_per_second: 0.0,
            gpu_utilization: 0.0,
            memory_usage: 0.0,
            hyperparams,
            config: request.config,
            created_at: Utc::now(),
            start_time: None,
            end_time: None,
            error: None,
        })
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Moves to `to` if the state machine allows it, stamping `start_time` / `end_time`.
    /// Returns `false` (and changes nothing) for an illegal transition.
    pub fn transition(&mut self, to: JobStatus) -> bool {
        if !self.status.can_transition_to(to) {
            return false;
        }
        self.status = to;
        let now = Utc::now();
        if to == JobStatus::Running {
            self.start_time = Some(now);
        }
        if to.is_terminal() {
            self.end_time = Some(now);
        }
        true
    }

    pub fn apply_gauges(&mut self, gauges: RuntimeGauges) {
        self.tokens_per_second = gauges.tokens_per_second;
        self.gpu_utilization = gauges.gpu_utilization;
        self.memory_usage = gauges.memory_usage;
    }

    /// Records progress for `step`. Steps never move backwards and never pass `total_steps`.
    pub fn record_step(&mut self, step: u64, sample: StepSample) {
        self.current_step = step.max(self.current_step).min(self.total_steps);
        self.progress = (u128::from(self.current_step) * 100 / u128::from(self.total_steps.max(1))) as u8;
        self.loss = sample.loss;
        self.reward = sample.reward;
        self.kl_divergence = sample.kl_divergence;
        self.apply_gauges(sample.gauges);
    }

    /// Last-known metrics, or `None` before the first step.
    #[must_use]
    pub fn metrics_snapshot(&self) -> Option<MetricsSnapshot> {
        (self.current_step > 0).then(|| MetricsSnapshot {
            step: self.current_step,
            loss: self.loss,
            reward: self.reward,
            kl_divergence: self.kl_divergence,
            learning_rate: self.hyperparams.learning_rate,
            tokens_per_second: self.tokens_per_second,
            gpu_utilization: self.gpu_utilization,
            memory_usage: self.memory_usage,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued_job(total_steps: u64) -> Job {
        Job::from_request(
            NewJob::new("gpt2-small", "python-code").with_total_steps(total_steps),
            &HyperParams::default(),
            1000,
        )
        .unwrap()
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Completed));

        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));

        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Stopped] {
            assert!(terminal.is_terminal());
            for to in [JobStatus::Queued, JobStatus::Running, JobStatus::Completed, JobStatus::Stopped] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_request_validation() {
        let defaults = HyperParams::default();
        assert!(Job::from_request(NewJob::new("", "d"), &defaults, 10).is_err());
        assert!(Job::from_request(NewJob::new("m", " "), &defaults, 10).is_err());
        assert!(Job::from_request(NewJob::new("m", "d").with_total_steps(0), &defaults, 10).is_err());

        let bad = HyperParams { learning_rate: 0.0, ..HyperParams::default() };
        assert!(Job::from_request(NewJob::new("m", "d").with_hyperparams(bad), &defaults, 10).is_err());
    }

    #[test]
    fn test_new_job_defaults() {
        let job = queued_job(100);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.name, "Untitled Training Job");
        assert_eq!(job.total_steps, 100);
        assert!(job.start_time.is_none());
        assert!(job.end_time.is_none());
        assert!(job.metrics_snapshot().is_none());
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut job = queued_job(100);
        assert!(!job.transition(JobStatus::Stopped));
        assert!(job.transition(JobStatus::Running));
        assert!(job.start_time.is_some());
        assert!(job.end_time.is_none());

        assert!(job.transition(JobStatus::Stopped));
        assert!(job.end_time.is_some());
        assert!(!job.transition(JobStatus::Completed));
        assert_eq!(job.status, JobStatus::Stopped);
    }

    #[test]
    fn test_record_step_is_monotonic_and_bounded() {
        let mut job = queued_job(100);
        job.record_step(50, StepSample::default());
        assert_eq!(job.current_step, 50);
        assert_eq!(job.progress, 50);

        job.record_step(25, StepSample::default());
        assert_eq!(job.current_step, 50);

        job.record_step(250, StepSample::default());
        assert_eq!(job.current_step, 100);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_progress_with_very_large_totals() {
        let mut job = queued_job(u64::MAX);
        job.record_step(u64::MAX / 2, StepSample::default());
        assert_eq!(job.progress, 49);

        job.record_step(u64::MAX, StepSample::default());
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_hyperparams_accept_both_key_styles() {
        let camel: HyperParams = serde_json::from_str(r#"{"learningRate": 0.002, "useGRPO": false}"#).unwrap();
        let snake: HyperParams = serde_json::from_str(r#"{"learning_rate": 0.002, "use_grpo": false}"#).unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.batch_size, HyperParams::default().batch_size);
        assert!(!camel.use_grpo);
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = queued_job(10);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["totalSteps"], 10);
        assert_eq!(value["hyperparams"]["useGRPO"], true);
        assert!(value.get("klDivergence").is_some());
    }
}
