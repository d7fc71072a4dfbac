use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type used throughout the pipeline
pub type Result<T> = std::result::Result<T, FlowError>;

/// Top-level error for pipeline operations
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Aggregate error: {0}")]
    Aggregate(String),
}

impl FlowError {
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Persistence failures abort the current delivery and are retried by redelivery.
    pub fn is_redeliverable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for FlowError {
    fn from(e: sqlx::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", e))
    }
}

/// Bad submission or template input, surfaced synchronously to the caller
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("batch name must not be empty")]
    EmptyBatchName,

    #[error("template not found: {0}")]
    UnknownTemplate(Uuid),

    #[error("no reports found in uploaded files")]
    NoReports,

    #[error("empty report text: {source_name}")]
    BlankReport { source_name: String },

    #[error("invalid file type: {0}. Only .json files are allowed")]
    UnsupportedFile(String),

    #[error("invalid JSON in {file}: {reason}")]
    MalformedUpload { file: String, reason: String },

    #[error("invalid template: {0}")]
    InvalidTemplate(String),
}

/// Failure category of a single extraction attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    ProviderUnavailable,
    InvalidResponseShape,
    RateLimited,
    Timeout,
    /// Provider refused the request outright (bad credentials, unknown model)
    RequestRejected,
}

impl ExtractionErrorKind {
    /// Transient kinds are worth another attempt after a backoff.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable | Self::RateLimited | Self::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderUnavailable => "provider_unavailable",
            Self::InvalidResponseShape => "invalid_response_shape",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::RequestRejected => "request_rejected",
        }
    }
}

impl std::fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub message: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::ProviderUnavailable, message)
    }

    pub fn invalid_response_shape(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::InvalidResponseShape, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ExtractionErrorKind::Timeout, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
