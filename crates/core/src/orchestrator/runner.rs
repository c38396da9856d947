//! Parallel orchestrator implementation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::types::{BranchResult, BranchStatus, OrchestratorError, RunOutcome, RunReport};
use crate::calibration::{CalibrationOutcome, CalibrationService};
use crate::catalog::CatalogSource;
use crate::detection::SourceDetector;
use crate::input::SourceImage;
use crate::pipeline::ReconciliationPipeline;

/// Runs calibration and detection for one image, then reconciles.
pub struct ParallelOrchestrator {
    calibration: Arc<dyn CalibrationService>,
    detector: Arc<dyn SourceDetector>,
    catalog: Arc<dyn CatalogSource>,
    pipeline: ReconciliationPipeline,
}

impl ParallelOrchestrator {
    pub fn new(
        calibration: Arc<dyn CalibrationService>,
        detector: Arc<dyn SourceDetector>,
        catalog: Arc<dyn CatalogSource>,
        pipeline: ReconciliationPipeline,
    ) -> Self {
        Self {
            calibration,
            detector,
            catalog,
            pipeline,
        }
    }

    /// Process one image.
    ///
    /// `observed_at` overrides the image's own `DATE-OBS`. Returns `Err` only
    /// for fatal calibration failures; any other branch failure yields
    /// [`RunOutcome::Incomplete`].
    pub async fn run(
        &self,
        image: SourceImage,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<RunReport, OrchestratorError> {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("run", run_id = %run_id, image = %image.name());
        self.run_inner(run_id, image, observed_at)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        run_id: String,
        image: SourceImage,
        observed_at: Option<DateTime<Utc>>,
    ) -> Result<RunReport, OrchestratorError> {
        let observed_at = observed_at.or_else(|| image.observation_time());
        info!(observed_at = ?observed_at, "Starting run");

        // Both branches run as tasks so a panic in either is reported as a
        // failed branch instead of unwinding through the run.
        let calibration = {
            let service = Arc::clone(&self.calibration);
            let image = image.clone();
            async move {
                let started = Instant::now();
                let result =
                    tokio::spawn(async move { service.calibrate(&image).await }.in_current_span())
                        .await;
                (result, elapsed_ms(started))
            }
        };

        let detection = {
            let detector = Arc::clone(&self.detector);
            let image = image.clone();
            let span = Span::current();
            async move {
                let started = Instant::now();
                let result = tokio::task::spawn_blocking(move || {
                    let _guard = span.enter();
                    detector.detect(&image)
                })
                .await;
                (result, elapsed_ms(started))
            }
        };

        let ((calibration, calibration_ms), (detection, detection_ms)) =
            tokio::join!(calibration, detection);

        let calibration = match calibration {
            Ok(Ok(CalibrationOutcome::Solved(solution))) => {
                BranchResult::completed(solution, calibration_ms)
            }
            Ok(Ok(CalibrationOutcome::TimedOut { phase, elapsed })) => {
                warn!(phase = ?phase, elapsed_secs = elapsed.as_secs(), "Calibration timed out");
                BranchResult::without_value(
                    BranchStatus::TimedOut {
                        phase,
                        elapsed_secs: elapsed.as_secs_f64(),
                    },
                    calibration_ms,
                )
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "Calibration failed fatally, aborting run");
                return Err(OrchestratorError::Calibration { run_id, source: e });
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Calibration failed");
                BranchResult::failed(e.to_string(), calibration_ms)
            }
            Err(e) => {
                error!(error = %e, "Calibration task did not finish");
                BranchResult::failed(format!("calibration task failed: {}", e), calibration_ms)
            }
        };

        let detection = match detection {
            Ok(Ok(report)) => BranchResult::completed(report, detection_ms),
            Ok(Err(e)) => {
                warn!(error = %e, "Detection failed");
                BranchResult::failed(e.to_string(), detection_ms)
            }
            Err(e) => {
                error!(error = %e, "Detection task did not finish");
                BranchResult::failed(format!("detection task failed: {}", e), detection_ms)
            }
        };

        let outcome = match (&calibration.value, &detection.value) {
            (Some(solution), Some(detections)) => RunOutcome::Complete(
                self.pipeline
                    .reconcile(detections, solution, self.catalog.as_ref(), observed_at)
                    .await,
            ),
            _ => {
                info!(
                    calibration = ?calibration.status,
                    detection = ?detection.status,
                    "Run incomplete, skipping reconciliation"
                );
                RunOutcome::Incomplete
            }
        };

        Ok(RunReport {
            run_id,
            image: image.name().to_string(),
            observed_at,
            calibration,
            detection,
            outcome,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationError, PollPhase};
    use crate::catalog::{CatalogAggregator, CatalogBackend, CatalogTag};
    use crate::testing::{fixtures, MockCatalogBackend, MockPlateSolver, MockSourceExtractor};
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        solver: Arc<MockPlateSolver>,
        extractor: Arc<MockSourceExtractor>,
        backend: Arc<MockCatalogBackend>,
        orchestrator: ParallelOrchestrator,
    }

    fn harness() -> Harness {
        let solver = Arc::new(MockPlateSolver::new());
        let extractor = Arc::new(MockSourceExtractor::new(fixtures::detection_report(vec![
            fixtures::detection(20.0, 20.0, 100.0),
            fixtures::detection(70.0, 70.0, 120.0),
        ])));
        let backend = Arc::new(MockCatalogBackend::time_dependent(CatalogTag::MinorPlanet));
        let aggregator =
            CatalogAggregator::new(vec![backend.clone() as Arc<dyn CatalogBackend>], 4, 1.0);
        let orchestrator = ParallelOrchestrator::new(
            solver.clone(),
            extractor.clone(),
            Arc::new(aggregator),
            ReconciliationPipeline::default(),
        );
        Harness {
            solver,
            extractor,
            backend,
            orchestrator,
        }
    }

    fn image() -> SourceImage {
        fixtures::png_image("field.png", 64, 64, &[], 20.0)
    }

    #[tokio::test]
    async fn test_both_branches_complete() {
        let h = harness();
        h.solver
            .set_solution(fixtures::solution(vec![[20.0, 20.0]]))
            .await;

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert!(report.calibration.is_completed());
        assert!(report.detection.is_completed());
        let reconciled = report.outcome.report().unwrap();
        assert_eq!(reconciled.outcome.known.len(), 1);
        assert_eq!(reconciled.outcome.unknown_positions(), vec![[70.0, 70.0]]);
        assert_eq!(h.solver.call_count().await, 1);
        assert_eq!(h.extractor.call_count(), 1);
        assert!(!report.run_id.is_empty());
    }

    #[tokio::test]
    async fn test_calibration_timeout_is_incomplete() {
        let h = harness();
        h.solver
            .set_timed_out(PollPhase::JobAssignment, Duration::from_secs(300))
            .await;

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert_eq!(
            report.calibration.status,
            BranchStatus::TimedOut {
                phase: PollPhase::JobAssignment,
                elapsed_secs: 300.0
            }
        );
        assert!(report.detection.is_completed());
        assert_eq!(report.outcome, RunOutcome::Incomplete);
        assert_eq!(h.backend.query_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_fatal_calibration_error_is_incomplete() {
        let h = harness();
        h.solver
            .set_next_error(CalibrationError::Authentication("bad key".into()))
            .await;

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert!(matches!(
            report.calibration.status,
            BranchStatus::Failed { ref error } if error.contains("bad key")
        ));
        assert_eq!(report.outcome, RunOutcome::Incomplete);
    }

    #[tokio::test]
    async fn test_remote_job_failure_terminates_run() {
        let h = harness();
        h.solver
            .set_next_error(CalibrationError::RemoteJobFailure {
                job_id: 7,
                status: "failure".into(),
            })
            .await;

        let err = h.orchestrator.run(image(), None).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Calibration {
                source: CalibrationError::RemoteJobFailure { job_id: 7, .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_detection_failure_keeps_calibration() {
        let h = harness();
        h.extractor.set_failure("corrupt raster");

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert!(report.calibration.is_completed());
        assert!(report.calibration.value.is_some());
        assert!(matches!(report.detection.status, BranchStatus::Failed { .. }));
        assert_eq!(report.outcome, RunOutcome::Incomplete);
    }

    #[tokio::test]
    async fn test_detection_panic_is_contained() {
        let h = harness();
        h.extractor.set_panic(true);

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert!(matches!(
            report.detection.status,
            BranchStatus::Failed { ref error } if error.contains("detection task failed")
        ));
        assert!(report.calibration.is_completed());
    }

    #[tokio::test]
    async fn test_calibration_panic_is_contained() {
        let h = harness();
        h.solver.set_panic(true).await;

        let report = h.orchestrator.run(image(), None).await.unwrap();

        assert!(matches!(
            report.calibration.status,
            BranchStatus::Failed { ref error } if error.contains("calibration task failed")
        ));
        assert!(report.detection.is_completed());
        assert_eq!(report.outcome, RunOutcome::Incomplete);
        assert_eq!(h.backend.query_count().await, 0);
    }

    #[tokio::test]
    async fn test_observation_time_from_fits_header() {
        let h = harness();
        let header = fixtures::fits_header(&[
            ("SIMPLE", "T"),
            ("BITPIX", "16"),
            ("NAXIS", "0"),
            ("DATE-OBS", "'2024-03-01T22:15:00'"),
        ]);
        let image = SourceImage::from_bytes("field.fits", header);

        let report = h.orchestrator.run(image, None).await.unwrap();

        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 22, 15, 0).unwrap();
        assert_eq!(report.observed_at, Some(expected));
    }

    #[tokio::test]
    async fn test_observation_time_override_reaches_catalogs() {
        let h = harness();
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();

        let report = h.orchestrator.run(image(), Some(at)).await.unwrap();

        assert_eq!(report.observed_at, Some(at));
        let queries = h.backend.queries().await;
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].observed_at, Some(at));
    }

    #[tokio::test]
    async fn test_time_dependent_backend_skipped_without_time() {
        let h = harness();

        let report = h.orchestrator.run(image(), None).await.unwrap();

        let reconciled = report.outcome.report().unwrap();
        assert_eq!(reconciled.skipped_catalogs, vec![CatalogTag::MinorPlanet]);
        assert_eq!(h.backend.query_count().await, 0);
    }
}
