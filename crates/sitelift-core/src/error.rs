use std::time::Duration;

use thiserror::Error;

use crate::job::JobStep;
use crate::models::ResponseBody;

/// Application-wide error types for Sitelift.
#[derive(Error, Debug)]
pub enum AppError {
    /// The realtime transport did not signal ready within the connect timeout.
    #[error("Connection timed out after {}s", .0.as_secs())]
    ConnectionTimeout(Duration),

    /// The realtime connection is closed or the transport refused a write.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Reconnection gave up after exhausting its attempt budget.
    #[error("Max reconnect attempts ({attempts}) exceeded")]
    MaxReconnectAttemptsExceeded { attempts: u32 },

    /// Admission denied by the sliding-window rate limiter.
    #[error("Rate limit exceeded. Try again in {retry_after_secs} seconds.")]
    RateLimitExceeded { retry_after_secs: u64 },

    /// Request was cancelled explicitly.
    #[error("Request was aborted")]
    RequestAborted,

    /// Request did not settle before its deadline.
    #[error("Request timed out after {}ms", .0.as_millis())]
    RequestTimeout(Duration),

    /// Remote endpoint answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: ResponseBody },

    /// Transport-level failure (DNS, connect, reset, body read).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The remote answered successfully but with a payload we cannot use.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The scraper collaborator failed to produce an artifact.
    #[error("Artifact error: {0}")]
    ArtifactError(String),

    /// A single asset upload failed.
    #[error("Upload of asset '{filename}' failed: {source}")]
    AssetUploadFailed {
        filename: String,
        #[source]
        source: Box<AppError>,
    },

    /// An extraction step failed; the job stays in its partial state.
    #[error("Extraction step '{step}' failed{suffix}: {source}", suffix = job_suffix(.job_id))]
    JobStepFailed {
        job_id: Option<String>,
        step: JobStep,
        #[source]
        source: Box<AppError>,
    },
}

fn job_suffix(job_id: &Option<String>) -> String {
    job_id
        .as_deref()
        .map(|id| format!(" for job {id}"))
        .unwrap_or_default()
}

impl AppError {
    /// Returns true if this error is transient and worth retrying by the caller.
    ///
    /// Nothing in the core retries on its own; this is advisory.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_)
            | AppError::RequestTimeout(_)
            | AppError::ConnectionTimeout(_)
            | AppError::ConnectionClosed(_)
            | AppError::RateLimitExceeded { .. } => true,
            AppError::HttpError { status, .. } => *status == 429 || *status >= 500,
            AppError::AssetUploadFailed { source, .. } | AppError::JobStepFailed { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    /// HTTP status carried by this error, looking through step wrappers.
    pub fn status(&self) -> Option<u16> {
        match self {
            AppError::HttpError { status, .. } => Some(*status),
            AppError::AssetUploadFailed { source, .. } | AppError::JobStepFailed { source, .. } => {
                source.status()
            }
            _ => None,
        }
    }

    pub(crate) fn at_step(self, job_id: Option<&str>, step: JobStep) -> Self {
        AppError::JobStepFailed {
            job_id: job_id.map(str::to_string),
            step,
            source: Box::new(self),
        }
    }
}
