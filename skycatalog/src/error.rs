use std::time::Duration;
use thiserror::Error;

use crate::job::{JobPhase, WaitError};

/// Errors that can occur while querying a catalog
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Transport(String),

    #[error("catalog service returned HTTP {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid catalog response: {0}")]
    InvalidResponse(String),

    #[error("invalid catalog query: {0}")]
    InvalidQuery(String),

    #[error("catalog job {job_id} finished in phase {phase}")]
    JobFailed { job_id: String, phase: JobPhase },

    #[error("catalog job did not finish within {0:?}")]
    Timeout(Duration),

    #[error("catalog query cancelled")]
    Cancelled,

    #[error("catalog file error: {0}")]
    File(String),
}

impl From<ureq::Error> for CatalogError {
    fn from(error: ureq::Error) -> Self {
        match error {
            ureq::Error::StatusCode(status) => CatalogError::Status {
                status,
                message: "request rejected".to_string(),
            },
            other => CatalogError::Transport(other.to_string()),
        }
    }
}

impl From<WaitError> for CatalogError {
    fn from(error: WaitError) -> Self {
        match error {
            WaitError::Timeout(limit) => CatalogError::Timeout(limit),
            WaitError::Cancelled => CatalogError::Cancelled,
        }
    }
}
