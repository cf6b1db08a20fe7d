use thiserror::Error;

use crate::store::StoreError;

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("processing failed: {0}")]
    ProcessingFailure(String),

    #[error("too many metrics subscribers for job {job_id} (limit {limit})")]
    SubscriberLimit { job_id: String, limit: usize },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Whether the API layer should surface this as a 404-equivalent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => Self::StoreUnavailable(reason),
            StoreError::Serialization(e) => Self::Json(e),
            StoreError::Io(e) => Self::StoreUnavailable(e.to_string()),
        }
    }
}
