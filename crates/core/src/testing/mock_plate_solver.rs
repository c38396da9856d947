//! Mock plate solver for testing.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::fixtures;
use crate::calibration::{
    CalibrationError, CalibrationOutcome, CalibrationService, CalibrationSolution, PollPhase,
};
use crate::input::SourceImage;

/// Mock implementation of the CalibrationService trait.
///
/// Solves every image with a fixed solution unless told otherwise.
///
/// # Example
///
/// ```rust,ignore
/// use skyrecon_core::testing::{MockPlateSolver, fixtures};
///
/// let solver = MockPlateSolver::new();
/// solver.set_solution(fixtures::solution(vec![[10.0, 10.0]])).await;
///
/// let outcome = solver.calibrate(&image).await?;
/// assert!(outcome.solution().is_some());
/// ```
#[derive(Debug)]
pub struct MockPlateSolver {
    outcome: Arc<RwLock<CalibrationOutcome>>,
    /// If set, the next call will fail with this error.
    next_error: Arc<RwLock<Option<CalibrationError>>>,
    /// Names of the images submitted so far.
    calls: Arc<RwLock<Vec<String>>>,
    /// If true, every call panics.
    panic: Arc<RwLock<bool>>,
}

impl Default for MockPlateSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlateSolver {
    pub fn new() -> Self {
        Self {
            outcome: Arc::new(RwLock::new(CalibrationOutcome::Solved(fixtures::solution(
                Vec::new(),
            )))),
            next_error: Arc::new(RwLock::new(None)),
            calls: Arc::new(RwLock::new(Vec::new())),
            panic: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn set_solution(&self, solution: CalibrationSolution) {
        *self.outcome.write().await = CalibrationOutcome::Solved(solution);
    }

    /// Report a polling timeout instead of a solution.
    pub async fn set_timed_out(&self, phase: PollPhase, elapsed: Duration) {
        *self.outcome.write().await = CalibrationOutcome::TimedOut { phase, elapsed };
    }

    pub async fn set_next_error(&self, error: CalibrationError) {
        *self.next_error.write().await = Some(error);
    }

    /// Make every call panic.
    pub async fn set_panic(&self, panic: bool) {
        *self.panic.write().await = panic;
    }

    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn submitted_images(&self) -> Vec<String> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl CalibrationService for MockPlateSolver {
    async fn calibrate(&self, image: &SourceImage) -> Result<CalibrationOutcome, CalibrationError> {
        self.calls.write().await.push(image.name().to_string());

        if *self.panic.read().await {
            panic!("mock plate solver panicked on {}", image.name());
        }

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        Ok(self.outcome.read().await.clone())
    }
}
