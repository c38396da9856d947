//! Calibration protocol state machine.
//!
//! `Idle -> Authenticated -> Uploaded -> AwaitingJob -> AwaitingSolve ->
//! Solved | Failed | TimedOut`. Transitions are a pure function of the current
//! state, the latest service response and the current instant, so the
//! protocol can be exercised without a network or real sleeps.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Timing limits for the polling phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    pub job_poll_interval: Duration,
    pub job_timeout: Duration,
    pub solve_poll_interval: Duration,
    pub solve_timeout: Duration,
    pub max_consecutive_poll_errors: u32,
}

/// Phase in which a poll loop ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    /// Waiting for the submission to be assigned a job.
    JobAssignment,
    /// Waiting for the job to finish solving.
    Solve,
}

/// Job status as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Processing,
    Solved,
    Failed(String),
}

impl JobStatus {
    /// Map a raw status string. Unknown values keep the job in processing.
    pub fn from_wire(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "success" | "solved" => JobStatus::Solved,
            "failure" | "failed" | "error" => JobStatus::Failed(status.to_string()),
            _ => JobStatus::Processing,
        }
    }
}

/// Input to a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    Authenticated,
    Uploaded { submission_id: u64 },
    /// Submission polled; `job_id` is set once the service assigned a job.
    SubmissionPolled { job_id: Option<u64> },
    JobPolled(JobStatus),
    /// A poll failed transiently or returned an unparseable body.
    PollFailed { error: String },
}

/// Why the protocol ended in [`ProtocolState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The service reported the job as failed.
    JobFailed { job_id: u64, status: String },
    /// Too many consecutive polls failed.
    PollErrors { count: u32, last_error: String },
    /// An event arrived that is not valid in the current state.
    UnexpectedEvent { state: String, event: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    Authenticated,
    Uploaded {
        submission_id: u64,
        at: Instant,
    },
    AwaitingJob {
        submission_id: u64,
        started: Instant,
        consecutive_errors: u32,
    },
    AwaitingSolve {
        submission_id: u64,
        job_id: u64,
        started: Instant,
        consecutive_errors: u32,
    },
    Solved {
        submission_id: u64,
        job_id: u64,
    },
    Failed(FailureReason),
    TimedOut {
        phase: PollPhase,
        elapsed: Duration,
    },
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolState::Solved { .. } | ProtocolState::Failed(_) | ProtocolState::TimedOut { .. }
        )
    }

    /// How long to wait before the next poll, for polling states.
    pub fn poll_delay(&self, limits: &PollLimits) -> Option<Duration> {
        match self {
            ProtocolState::AwaitingJob { .. } => Some(limits.job_poll_interval),
            ProtocolState::AwaitingSolve { .. } => Some(limits.solve_poll_interval),
            _ => None,
        }
    }

    /// Apply one event.
    pub fn advance(self, event: ProtocolEvent, now: Instant, limits: &PollLimits) -> ProtocolState {
        if self.is_terminal() {
            return self;
        }

        // Polling starts the moment the upload is acknowledged.
        let state = match self {
            ProtocolState::Uploaded { submission_id, at } => ProtocolState::AwaitingJob {
                submission_id,
                started: at,
                consecutive_errors: 0,
            },
            other => other,
        };

        match (state, event) {
            (ProtocolState::Idle, ProtocolEvent::Authenticated) => ProtocolState::Authenticated,

            (ProtocolState::Authenticated, ProtocolEvent::Uploaded { submission_id }) => {
                ProtocolState::Uploaded {
                    submission_id,
                    at: now,
                }
            }

            (
                ProtocolState::AwaitingJob {
                    submission_id,
                    started,
                    ..
                },
                ProtocolEvent::SubmissionPolled { job_id },
            ) => match job_id {
                Some(job_id) => ProtocolState::AwaitingSolve {
                    submission_id,
                    job_id,
                    started: now,
                    consecutive_errors: 0,
                },
                None => check_timeout(
                    ProtocolState::AwaitingJob {
                        submission_id,
                        started,
                        consecutive_errors: 0,
                    },
                    PollPhase::JobAssignment,
                    started,
                    now,
                    limits.job_timeout,
                ),
            },

            (
                ProtocolState::AwaitingJob {
                    submission_id,
                    started,
                    consecutive_errors,
                },
                ProtocolEvent::PollFailed { error },
            ) => {
                let count = consecutive_errors + 1;
                if count >= limits.max_consecutive_poll_errors {
                    return ProtocolState::Failed(FailureReason::PollErrors {
                        count,
                        last_error: error,
                    });
                }
                check_timeout(
                    ProtocolState::AwaitingJob {
                        submission_id,
                        started,
                        consecutive_errors: count,
                    },
                    PollPhase::JobAssignment,
                    started,
                    now,
                    limits.job_timeout,
                )
            }

            (
                ProtocolState::AwaitingSolve {
                    submission_id,
                    job_id,
                    started,
                    ..
                },
                ProtocolEvent::JobPolled(status),
            ) => match status {
                JobStatus::Solved => ProtocolState::Solved {
                    submission_id,
                    job_id,
                },
                JobStatus::Failed(status) => {
                    ProtocolState::Failed(FailureReason::JobFailed { job_id, status })
                }
                JobStatus::Processing => check_timeout(
                    ProtocolState::AwaitingSolve {
                        submission_id,
                        job_id,
                        started,
                        consecutive_errors: 0,
                    },
                    PollPhase::Solve,
                    started,
                    now,
                    limits.solve_timeout,
                ),
            },

            (
                ProtocolState::AwaitingSolve {
                    submission_id,
                    job_id,
                    started,
                    consecutive_errors,
                },
                ProtocolEvent::PollFailed { error },
            ) => {
                let count = consecutive_errors + 1;
                if count >= limits.max_consecutive_poll_errors {
                    return ProtocolState::Failed(FailureReason::PollErrors {
                        count,
                        last_error: error,
                    });
                }
                check_timeout(
                    ProtocolState::AwaitingSolve {
                        submission_id,
                        job_id,
                        started,
                        consecutive_errors: count,
                    },
                    PollPhase::Solve,
                    started,
                    now,
                    limits.solve_timeout,
                )
            }

            (state, event) => ProtocolState::Failed(FailureReason::UnexpectedEvent {
                state: format!("{:?}", state),
                event: format!("{:?}", event),
            }),
        }
    }
}

fn check_timeout(
    state: ProtocolState,
    phase: PollPhase,
    started: Instant,
    now: Instant,
    timeout: Duration,
) -> ProtocolState {
    let elapsed = now.saturating_duration_since(started);
    if elapsed >= timeout {
        ProtocolState::TimedOut { phase, elapsed }
    } else {
        state
    }
}

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.saturating_mul(factor).min(cap)
}
