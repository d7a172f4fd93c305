use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Capture provider returned HTTP {status}: {body}")]
    ProviderRequestFailed { status: u16, body: String },

    #[error("Malformed capture provider response: {0}")]
    ProviderResponseMalformed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Image decode error: {0}")]
    ImageDecodeError(String),

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Batch deadline of {deadline:?} reached: {detail}")]
    BatchTimeout { deadline: Duration, detail: String },

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable snake_case code used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::InvalidBatch(_) => "invalid_batch",
            PipelineError::InvalidUrl(_) => "invalid_url",
            PipelineError::ProviderRequestFailed { .. } => "provider_request_failed",
            PipelineError::ProviderResponseMalformed(_) => "provider_response_malformed",
            PipelineError::NetworkError(_) => "network_error",
            PipelineError::ImageDecodeError(_) => "image_decode_error",
            PipelineError::UploadFailed(_) => "upload_failed",
            PipelineError::BatchTimeout { .. } => "batch_timeout",
            PipelineError::ConfigurationError(_) => "configuration_error",
            PipelineError::IoError(_) => "io_error",
            PipelineError::SerializationError(_) => "serialization_error",
            PipelineError::Internal(_) => "internal",
        }
    }

    /// Errors that reject the whole request instead of a single item.
    pub fn is_batch_level(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidBatch(_)
                | PipelineError::ConfigurationError(_)
                | PipelineError::Internal(_)
        )
    }

    pub fn to_failure(&self) -> FailureReason {
        FailureReason {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

/// Wire form of a per-item failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReason {
    pub kind: String,
    pub message: String,
}

impl From<AcquireError> for PipelineError {
    fn from(err: AcquireError) -> Self {
        PipelineError::Internal(format!("concurrency limiter closed: {err}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}

impl From<image::ImageError> for PipelineError {
    fn from(err: image::ImageError) -> Self {
        PipelineError::ImageDecodeError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_level_errors() {
        assert!(PipelineError::InvalidBatch("empty".to_string()).is_batch_level());
        assert!(PipelineError::Internal("panic".to_string()).is_batch_level());
        assert!(!PipelineError::NetworkError("reset".to_string()).is_batch_level());
        assert!(!PipelineError::UploadFailed("denied".to_string()).is_batch_level());
        assert!(!PipelineError::BatchTimeout {
            deadline: Duration::from_secs(1),
            detail: "not started".to_string(),
        }
        .is_batch_level());
    }

    #[test]
    fn test_failure_reason_carries_provider_body() {
        let err = PipelineError::ProviderRequestFailed {
            status: 429,
            body: "quota exceeded".to_string(),
        };
        let failure = err.to_failure();
        assert_eq!(failure.kind, "provider_request_failed");
        assert!(failure.message.contains("429"));
        assert!(failure.message.contains("quota exceeded"));
    }
}
