//! One-shot work records: datasets, evaluations and synthesis results.
//!
//! Each record is created in `processing` and moved exactly once to `ready`
//! or `error` by its step processor.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processing,
    Ready,
    Error,
}

impl ProcessingStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common surface the step processors rely on.
pub trait ProcessedRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn status(&self) -> ProcessingStatus;
    /// Moves the record to `error`, keeping `message`.
    fn fail(&mut self, message: String);
}

pub(crate) fn new_record_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub format: String,
    /// Human-readable size, e.g. "4.2 MB".
    pub size: String,
    pub examples: u64,
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataset {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl Dataset {
    #[must_use]
    pub fn from_request(request: NewDataset) -> Self {
        Self {
            id: new_record_id(),
            name: request.name,
            description: request.description,
            format: request.format.unwrap_or_else(|| "jsonl".to_string()),
            size: "0 MB".to_string(),
            examples: 0,
            status: ProcessingStatus::Processing,
            error: None,
            created_at: Utc::now(),
        }
    }
}

impl ProcessedRecord for Dataset {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ProcessingStatus {
        self.status
    }

    fn fail(&mut self, message: String) {
        self.status = ProcessingStatus::Error;
        self.error = Some(message);
    }
}

/// Per-criterion judge scores, each on a 0-10 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CriteriaScores {
    pub helpfulness: f64,
    pub accuracy: f64,
    pub safety: f64,
    pub clarity: f64,
    pub completeness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgedExample {
    pub prompt: String,
    pub response: String,
    pub score: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub id: String,
    pub model: String,
    pub judge_model: String,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<String>,
    pub status: ProcessingStatus,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub scores: Option<CriteriaScores>,
    #[serde(default)]
    pub examples: Vec<JudgedExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvaluation {
    pub model: String,
    pub judge_model: String,
    #[serde(default)]
    pub prompts: Vec<String>,
    #[serde(default)]
    pub criteria: Vec<String>,
}

impl Evaluation {
    #[must_use]
    pub fn from_request(request: NewEvaluation) -> Self {
        Self {
            id: new_record_id(),
            model: request.model,
            judge_model: request.judge_model,
            prompts: request.prompts,
            criteria: request.criteria,
            status: ProcessingStatus::Processing,
            overall_score: None,
            scores: None,
            examples: Vec::new(),
            error: None,
            created_at: Utc::now(),
        }
    }
}

impl ProcessedRecord for Evaluation {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ProcessingStatus {
        self.status
    }

    fn fail(&mut self, message: String) {
        self.status = ProcessingStatus::Error;
        self.error = Some(message);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticExample {
    pub prompt: String,
    pub response: String,
    pub topic: String,
    pub difficulty: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisResult {
    pub id: String,
    pub topic: String,
    pub difficulty: String,
    pub format: String,
    pub temperature: f64,
    /// Count asked for by the caller, before the batch cap.
    pub requested_examples: u64,
    /// Count actually generated.
    pub num_examples: u64,
    #[serde(default)]
    pub examples: Vec<SyntheticExample>,
    pub status: ProcessingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSynthesis {
    pub topic: String,
    #[serde(default = "default_num_examples")]
    pub num_examples: u64,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

fn default_num_examples() -> u64 {
    10
}

fn default_difficulty() -> String {
    "medium".to_string()
}

fn default_format() -> String {
    "jsonl".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

impl NewSynthesis {
    pub fn new(topic: impl Into<String>, num_examples: u64) -> Self {
        Self {
            topic: topic.into(),
            num_examples,
            difficulty: default_difficulty(),
            format: default_format(),
            temperature: default_temperature(),
        }
    }
}

impl SynthesisResult {
    #[must_use]
    pub fn from_request(request: NewSynthesis) -> Self {
        Self {
            id: new_record_id(),
            topic: request.topic,
            difficulty: request.difficulty,
            format: request.format,
            temperature: request.temperature,
            requested_examples: request.num_examples,
            num_examples: 0,
            examples: Vec::new(),
            status: ProcessingStatus::Processing,
            error: None,
            created_at: Utc::now(),
        }
    }
}

impl ProcessedRecord for SynthesisResult {
    fn id(&self) -> &str {
        &self.id
    }

    fn status(&self) -> ProcessingStatus {
        self.status
    }

    fn fail(&mut self, message: String) {
        self.status = ProcessingStatus::Error;
        self.error = Some(message);
    }
}

/// Catalog entry for a base model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub size: String,
    pub description: String,
    pub parameters: String,
    pub recommended: bool,
}

impl ModelInfo {
    fn entry(id: &str, name: &str, size: &str, description: &str, parameters: &str, recommended: bool) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            size: size.to_string(),
            description: description.to_string(),
            parameters: parameters.to_string(),
            recommended,
        }
    }

    /// Catalog seeded into an empty store.
    #[must_use]
    pub fn default_catalog() -> Vec<Self> {
        vec![
            Self::entry(
                "gpt2-small",
                "GPT-2 Small",
                "124M",
                "Small, fast, perfect for testing and prototyping",
                "124 million",
                true,
            ),
            Self::entry(
                "gpt2-medium",
                "GPT-2 Medium",
                "355M",
                "Good balance of size and performance",
                "355 million",
                false,
            ),
            Self::entry(
                "gpt2-large",
                "GPT-2 Large",
                "774M",
                "Larger model with better performance",
                "774 million",
                false,
            ),
            Self::entry(
                "llama-2-7b",
                "Llama 2 7B",
                "7B",
                "Meta's Llama 2 model, excellent for fine-tuning",
                "7 billion",
                true,
            ),
        ]
    }
}

/// Formats a byte count the way dataset sizes are displayed ("2.4 MB").
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["Bytes", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 Bytes".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}
