//! Types for the parallel orchestrator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::calibration::{CalibrationError, PollPhase};
use crate::pipeline::ReconciliationReport;

/// Errors that terminate a run.
///
/// Everything not listed here degrades into a [`RunOutcome::Incomplete`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The calibration failed in a way no retry can fix.
    #[error("run {run_id}: calibration failed: {source}")]
    Calibration {
        run_id: String,
        #[source]
        source: CalibrationError,
    },
}

/// How one branch of a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchStatus {
    Completed,
    /// Calibration polling ran out of time.
    TimedOut { phase: PollPhase, elapsed_secs: f64 },
    Failed { error: String },
}

/// Result of one branch: its status, its value when it completed, and how
/// long it took.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchResult<T> {
    #[serde(flatten)]
    pub status: BranchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    pub elapsed_ms: u64,
}

impl<T> BranchResult<T> {
    pub fn completed(value: T, elapsed_ms: u64) -> Self {
        Self {
            status: BranchStatus::Completed,
            value: Some(value),
            elapsed_ms,
        }
    }

    pub fn without_value(status: BranchStatus, elapsed_ms: u64) -> Self {
        Self {
            status,
            value: None,
            elapsed_ms,
        }
    }

    pub fn failed(error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::without_value(
            BranchStatus::Failed {
                error: error.into(),
            },
            elapsed_ms,
        )
    }

    pub fn is_completed(&self) -> bool {
        self.status == BranchStatus::Completed
    }
}

/// Whether reconciliation ran.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete(ReconciliationReport),
    /// At least one branch produced no value; see the branch statuses.
    Incomplete,
}

impl RunOutcome {
    pub fn report(&self) -> Option<&ReconciliationReport> {
        match self {
            RunOutcome::Complete(report) => Some(report),
            RunOutcome::Incomplete => None,
        }
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub image: String,
    pub observed_at: Option<DateTime<Utc>>,
    pub calibration: BranchResult<crate::calibration::CalibrationSolution>,
    pub detection: BranchResult<crate::detection::DetectionReport>,
    pub outcome: RunOutcome,
}
