//! Calibration protocol integration tests.
//!
//! These tests run the plate-solving client against an in-process HTTP
//! server speaking the astrometry.net API:
//! - Login, upload, polling and artifact download
//! - Session re-authentication
//! - Fast failure on a failed job
//! - Job-assignment timeout sentinel
//! - Retries of transient login and upload failures
//! - Degraded and unreadable reference lists
//! - End-to-end orchestration with real detection

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use skyrecon_core::{
    calibration::PollPhase,
    catalog::CatalogTag,
    testing::{fixtures, MockCatalogBackend},
    AstrometryNetClient, BlobDetector, CalibrationConfig, CalibrationError, CalibrationOutcome,
    CalibrationService, CatalogAggregator, CatalogBackend, CoordinateTransform, DetectionConfig,
    ParallelOrchestrator, ReconciliationPipeline, RunOutcome, SourceImage,
};

const SUBMISSION_ID: u64 = 42;
const JOB_ID: u64 = 7;
const IMAGE_SIZE: u32 = 64;

/// What the reference-list endpoint serves.
#[derive(Clone, Copy, PartialEq)]
enum ReferenceFile {
    Table,
    Missing,
    /// A table cut off in the middle of its data.
    Truncated,
    /// A well-formed table without any recognised column pair.
    UnknownColumns,
}

/// Behaviour and call log of the mock plate-solving service.
struct SolverState {
    /// Sessions handed out by successive logins.
    sessions: Vec<&'static str>,
    /// Sessions the upload endpoint accepts.
    valid_sessions: Vec<&'static str>,
    /// The first this many login requests get a 503.
    failing_logins: usize,
    /// Status returned by the upload endpoint instead of handling the upload.
    upload_status: Option<StatusCode>,
    assign_job: bool,
    job_status: &'static str,
    reference: ReferenceFile,
    login_requests: AtomicUsize,
    logins: AtomicUsize,
    upload_sessions: Mutex<Vec<String>>,
    job_polls: AtomicUsize,
    reference_requests: AtomicUsize,
}

impl Default for SolverState {
    fn default() -> Self {
        Self {
            sessions: vec!["session-1"],
            valid_sessions: vec!["session-1"],
            failing_logins: 0,
            upload_status: None,
            assign_job: true,
            job_status: "success",
            reference: ReferenceFile::Table,
            login_requests: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            upload_sessions: Mutex::new(Vec::new()),
            job_polls: AtomicUsize::new(0),
            reference_requests: AtomicUsize::new(0),
        }
    }
}

async fn login(
    State(state): State<Arc<SolverState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<Json<Value>, StatusCode> {
    if state.login_requests.fetch_add(1, Ordering::SeqCst) < state.failing_logins {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let request: Value = serde_json::from_str(&form["request-json"]).unwrap();
    if request["apikey"] != "test-key" {
        return Ok(Json(json!({ "status": "error", "errormessage": "bad apikey" })));
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst);
    let session = state.sessions[n.min(state.sessions.len() - 1)];
    Ok(Json(
        json!({ "status": "success", "message": "authenticated", "session": session }),
    ))
}

async fn upload(
    State(state): State<Arc<SolverState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<Value>) {
    let mut session = String::new();
    let mut file_len = 0;
    while let Some(field) = multipart.next_field().await.unwrap() {
        match field.name() {
            Some("request-json") => {
                let request: Value = serde_json::from_str(&field.text().await.unwrap()).unwrap();
                session = request["session"].as_str().unwrap_or_default().to_string();
            }
            Some("file") => file_len = field.bytes().await.unwrap().len(),
            _ => {}
        }
    }
    state.upload_sessions.lock().unwrap().push(session.clone());

    if let Some(status) = state.upload_status {
        return (status, Json(json!({ "status": "error" })));
    }
    if !state.valid_sessions.iter().any(|s| *s == session) {
        return (
            StatusCode::OK,
            Json(json!({ "status": "error", "errormessage": "no session with key" })),
        );
    }
    assert!(file_len > 0);
    (
        StatusCode::OK,
        Json(json!({ "status": "success", "subid": SUBMISSION_ID, "hash": "abc" })),
    )
}

async fn submission(State(state): State<Arc<SolverState>>, Path(id): Path<u64>) -> Json<Value> {
    assert_eq!(id, SUBMISSION_ID);
    let jobs = if state.assign_job {
        json!([JOB_ID])
    } else {
        json!([])
    };
    Json(json!({ "processing_started": "2024-01-01", "jobs": jobs }))
}

async fn job(State(state): State<Arc<SolverState>>, Path(id): Path<u64>) -> Json<Value> {
    assert_eq!(id, JOB_ID);
    state.job_polls.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "status": state.job_status }))
}

fn wcs_bytes() -> Vec<u8> {
    fixtures::wcs_header_bytes(150.0, 2.0, 1.0, IMAGE_SIZE, IMAGE_SIZE)
}

async fn wcs_file(Path(id): Path<u64>) -> impl IntoResponse {
    assert_eq!(id, JOB_ID);
    wcs_bytes()
}

async fn rdls_file(
    State(state): State<Arc<SolverState>>,
    Path(id): Path<u64>,
) -> impl IntoResponse {
    assert_eq!(id, JOB_ID);
    state.reference_requests.fetch_add(1, Ordering::SeqCst);
    // 1-based FITS pixels of the star at (16, 16).
    let table = fixtures::fits_bintable(&[("X", &[17.0]), ("Y", &[17.0])]);
    match state.reference {
        ReferenceFile::Table => (StatusCode::OK, table),
        ReferenceFile::Missing => (StatusCode::NOT_FOUND, Vec::new()),
        ReferenceFile::Truncated => {
            // Primary header, table header, then a few data bytes.
            (StatusCode::OK, table[..2 * 2880 + 4].to_vec())
        }
        ReferenceFile::UnknownColumns => (
            StatusCode::OK,
            fixtures::fits_bintable(&[("MAG", &[12.0]), ("FLUX", &[300.0])]),
        ),
    }
}

async fn spawn_solver(state: SolverState) -> (SocketAddr, Arc<SolverState>) {
    let state = Arc::new(state);
    let app = Router::new()
        .route("/api/login", post(login))
        .route("/api/upload", post(upload))
        .route("/api/submissions/{id}", get(submission))
        .route("/api/jobs/{id}", get(job))
        .route("/wcs_file/{id}", get(wcs_file))
        .route("/rdls_file/{id}", get(rdls_file))
        .with_state(Arc::clone(&state));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn config(addr: SocketAddr) -> CalibrationConfig {
    CalibrationConfig {
        api_url: format!("http://{}/api", addr),
        api_key: "test-key".to_string(),
        job_poll_interval_secs: 1,
        job_timeout_secs: 2,
        solve_poll_interval_secs: 1,
        solve_timeout_secs: 5,
        download_attempts: 2,
        backoff_base_secs: 0,
        backoff_cap_secs: 0,
        request_timeout_secs: 5,
        ..Default::default()
    }
}

fn stars() -> [(f64, f64, f64); 3] {
    [(16.0, 16.0, 200.0), (44.0, 20.0, 200.0), (30.0, 46.0, 200.0)]
}

fn image() -> SourceImage {
    fixtures::png_image("field.png", IMAGE_SIZE, IMAGE_SIZE, &stars(), 20.0)
}

async fn calibrate(
    state: SolverState,
) -> (Result<CalibrationOutcome, CalibrationError>, Arc<SolverState>) {
    let (addr, state) = spawn_solver(state).await;
    let client = AstrometryNetClient::new(config(addr)).unwrap();
    (client.calibrate(&image()).await, state)
}

#[tokio::test]
async fn test_calibration_success() {
    let (result, state) = calibrate(SolverState::default()).await;

    let outcome = result.unwrap();
    let solution = outcome.solution().unwrap();
    assert_eq!(solution.submission_id, SUBMISSION_ID);
    assert_eq!(solution.job_id, JOB_ID);
    assert_eq!(solution.reference_sources, vec![[16.0, 16.0]]);
    assert!(!solution.reference_degraded);
    assert_eq!(solution.transform.image_size(), Some((IMAGE_SIZE, IMAGE_SIZE)));

    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
    assert_eq!(state.job_polls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_session_rejected_reauthenticates_once() {
    let (result, state) = calibrate(SolverState {
        sessions: vec!["stale", "fresh"],
        valid_sessions: vec!["fresh"],
        ..Default::default()
    })
    .await;

    assert!(result.unwrap().solution().is_some());
    assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(
        *state.upload_sessions.lock().unwrap(),
        vec!["stale".to_string(), "fresh".to_string()]
    );
}

#[tokio::test]
async fn test_session_rejected_twice_fails() {
    let (result, state) = calibrate(SolverState {
        sessions: vec!["stale"],
        valid_sessions: vec![],
        ..Default::default()
    })
    .await;

    assert!(matches!(result, Err(CalibrationError::Authentication(_))));
    assert_eq!(state.logins.load(Ordering::SeqCst), 2);
    assert_eq!(state.upload_sessions.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_job_fails_fast() {
    let (result, state) = calibrate(SolverState {
        job_status: "failure",
        ..Default::default()
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        CalibrationError::RemoteJobFailure { job_id: JOB_ID, .. }
    ));
    assert_eq!(state.job_polls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_job_assignment_timeout_is_not_an_error() {
    let started = std::time::Instant::now();
    let (result, state) = calibrate(SolverState {
        assign_job: false,
        ..Default::default()
    })
    .await;

    match result.unwrap() {
        CalibrationOutcome::TimedOut { phase, elapsed } => {
            assert_eq!(phase, PollPhase::JobAssignment);
            assert!(elapsed >= Duration::from_secs(2));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(state.job_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_reference_list_degrades() {
    let (result, state) = calibrate(SolverState {
        reference: ReferenceFile::Missing,
        ..Default::default()
    })
    .await;

    let outcome = result.unwrap();
    let solution = outcome.solution().unwrap();
    assert!(solution.reference_degraded);
    assert!(solution.reference_sources.is_empty());
    assert_eq!(state.reference_requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_truncated_reference_list_degrades() {
    let (result, state) = calibrate(SolverState {
        reference: ReferenceFile::Truncated,
        ..Default::default()
    })
    .await;

    let outcome = result.unwrap();
    let solution = outcome.solution().unwrap();
    assert!(solution.reference_degraded);
    assert!(solution.reference_sources.is_empty());
    assert_eq!(solution.transform.image_size(), Some((IMAGE_SIZE, IMAGE_SIZE)));
    assert_eq!(state.reference_requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unrecognised_reference_columns_are_fatal() {
    let (result, _state) = calibrate(SolverState {
        reference: ReferenceFile::UnknownColumns,
        ..Default::default()
    })
    .await;

    let err = result.unwrap_err();
    assert!(err.is_fatal(), "unexpected error: {}", err);
}

#[tokio::test]
async fn test_transient_login_failure_is_retried() {
    let (result, state) = calibrate(SolverState {
        failing_logins: 1,
        ..Default::default()
    })
    .await;

    assert!(result.unwrap().solution().is_some());
    assert_eq!(state.login_requests.load(Ordering::SeqCst), 2);
    assert_eq!(state.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_login_unavailable_after_retries() {
    let (result, state) = calibrate(SolverState {
        failing_logins: usize::MAX,
        ..Default::default()
    })
    .await;

    assert!(matches!(result, Err(CalibrationError::TransientNetwork(_))));
    assert_eq!(state.login_requests.load(Ordering::SeqCst), 2);
    assert!(state.upload_sessions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_upload_is_upload_failure() {
    let (result, state) = calibrate(SolverState {
        upload_status: Some(StatusCode::BAD_REQUEST),
        ..Default::default()
    })
    .await;

    assert!(matches!(result, Err(CalibrationError::UploadFailure(_))));
    assert_eq!(state.upload_sessions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_upload_server_error_is_retried() {
    let (result, state) = calibrate(SolverState {
        upload_status: Some(StatusCode::SERVICE_UNAVAILABLE),
        ..Default::default()
    })
    .await;

    match result {
        Err(CalibrationError::UploadFailure(reason)) => assert!(reason.contains("503")),
        other => panic!("expected upload failure, got {:?}", other),
    }
    assert_eq!(state.upload_sessions.lock().unwrap().len(), 2);
    assert_eq!(state.job_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_orchestrated_run_end_to_end() {
    let (addr, _state) = spawn_solver(SolverState::default()).await;
    let client = AstrometryNetClient::new(config(addr)).unwrap();

    let transform = CoordinateTransform::from_fits_bytes(&wcs_bytes()).unwrap();
    let catalogued = transform.pixel_to_sky(44.0, 20.0).unwrap();
    let gaia = Arc::new(MockCatalogBackend::new(CatalogTag::GaiaDr3));
    gaia.set_entries(vec![fixtures::catalog_entry(
        CatalogTag::GaiaDr3,
        catalogued.ra_deg,
        catalogued.dec_deg,
    )])
    .await;

    let orchestrator = ParallelOrchestrator::new(
        Arc::new(client),
        Arc::new(BlobDetector::new(DetectionConfig {
            background_cell: 32,
            ..Default::default()
        })),
        Arc::new(CatalogAggregator::new(
            vec![gaia.clone() as Arc<dyn CatalogBackend>],
            4,
            1.0,
        )),
        ReconciliationPipeline::default(),
    );

    let report = orchestrator.run(image(), None).await.unwrap();

    assert!(report.calibration.is_completed());
    assert!(report.detection.is_completed());
    let RunOutcome::Complete(reconciled) = report.outcome else {
        panic!("run incomplete: {:?}", report.calibration.status);
    };
    assert_eq!(reconciled.stage_counts.reference_matched, 1);
    assert_eq!(reconciled.stage_counts.catalog_matched, 1);
    assert_eq!(reconciled.outcome.unknown.len(), 1);
    let [x, y] = reconciled.outcome.unknown[0].detection.position();
    assert!((x - 30.0).abs() < 1.0 && (y - 46.0).abs() < 1.0);
    assert_eq!(gaia.query_count().await, 1);
}
