//! Plate-solving calibration.
//!
//! [`CalibrationService`] turns an image into a [`CalibrationSolution`]
//! (coordinate transform + reference source list). The production adapter is
//! [`AstrometryNetClient`], which drives the remote protocol through the pure
//! state machine in [`protocol`].

mod client;
mod config;
pub mod protocol;

pub use client::AstrometryNetClient;
pub use config::{CalibrationConfig, UploadHints};
pub use protocol::{JobStatus, PollLimits, PollPhase, ProtocolEvent, ProtocolState};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::input::SourceImage;
use crate::reference::ReferenceListError;
use crate::wcs::{CoordinateTransform, WcsError};

/// Errors that can occur while calibrating an image.
#[derive(Debug, Error)]
pub enum CalibrationError {
    /// Connection failure, timeout or 5xx response.
    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    /// Login rejected, or the session stayed invalid after re-authenticating.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The service reported the job as failed.
    #[error("Remote job {job_id} failed with status '{status}'")]
    RemoteJobFailure { job_id: u64, status: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Upload failed: {0}")]
    UploadFailure(String),

    /// Artifact download retries exhausted.
    #[error("Artifact '{artifact}' unavailable after {attempts} attempts: {last_error}")]
    ArtifactUnavailable {
        artifact: String,
        attempts: u32,
        last_error: String,
    },

    /// Too many consecutive poll failures.
    #[error("Giving up after {count} consecutive poll errors: {last_error}")]
    PollErrors { count: u32, last_error: String },

    /// The service answered out of protocol order.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid coordinate transform: {0}")]
    Wcs(#[from] WcsError),

    #[error("Invalid reference list: {0}")]
    ReferenceList(#[from] ReferenceListError),
}

impl CalibrationError {
    /// Whether the failing request may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CalibrationError::TransientNetwork(_) | CalibrationError::MalformedResponse(_)
        )
    }

    /// Whether this failure must terminate processing of the image.
    ///
    /// Only an explicit job failure and an unreadable reference list are
    /// fatal; everything else degrades to "no calibration".
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CalibrationError::RemoteJobFailure { .. }
                | CalibrationError::ReferenceList(ReferenceListError::DataShape(_))
        )
    }
}

/// Result of a successful solve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationSolution {
    pub transform: CoordinateTransform,
    /// Reference sources in 0-based pixel coordinates.
    pub reference_sources: Vec<[f64; 2]>,
    pub submission_id: u64,
    pub job_id: u64,
    /// The reference list could not be downloaded or read; `reference_sources` is empty.
    pub reference_degraded: bool,
}

/// Terminal, non-error outcomes of a calibration attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationOutcome {
    Solved(CalibrationSolution),
    /// Polling exceeded its time budget. Not an error: the caller decides.
    TimedOut { phase: PollPhase, elapsed: Duration },
}

impl CalibrationOutcome {
    pub fn solution(&self) -> Option<&CalibrationSolution> {
        match self {
            CalibrationOutcome::Solved(solution) => Some(solution),
            CalibrationOutcome::TimedOut { .. } => None,
        }
    }
}

/// Capability: calibrate an image against the sky.
#[async_trait]
pub trait CalibrationService: Send + Sync {
    async fn calibrate(&self, image: &SourceImage)
        -> Result<CalibrationOutcome, CalibrationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(CalibrationError::TransientNetwork("reset".into()).is_retryable());
        assert!(CalibrationError::MalformedResponse("{".into()).is_retryable());
        assert!(!CalibrationError::Authentication("bad key".into()).is_retryable());

        let job = CalibrationError::RemoteJobFailure {
            job_id: 3,
            status: "failure".into(),
        };
        assert!(job.is_fatal());
        assert!(!job.is_retryable());

        let shape = CalibrationError::ReferenceList(ReferenceListError::DataShape("x".into()));
        assert!(shape.is_fatal());

        let artifact = CalibrationError::ArtifactUnavailable {
            artifact: "wcs".into(),
            attempts: 5,
            last_error: "HTTP 503".into(),
        };
        assert!(!artifact.is_fatal());
        assert!(!CalibrationError::UploadFailure("x".into()).is_fatal());
    }
}
