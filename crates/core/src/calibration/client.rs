//! astrometry.net-compatible plate-solving client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::input::SourceImage;
use crate::metrics;
use crate::reference::{parse_reference_list, ReferenceListError};
use crate::wcs::CoordinateTransform;

use super::protocol::{
    backoff_delay, FailureReason, JobStatus, PollLimits, ProtocolEvent, ProtocolState,
};
use super::{
    CalibrationConfig, CalibrationError, CalibrationOutcome, CalibrationService,
    CalibrationSolution,
};

const WCS_ARTIFACT: &str = "wcs_file";
const REFERENCE_ARTIFACT: &str = "rdls_file";

/// Plate-solving client.
pub struct AstrometryNetClient {
    client: Client,
    config: CalibrationConfig,
    /// Session token (refreshed on auth failure).
    session: Arc<RwLock<Option<String>>>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<u64>,
    errormessage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionResponse {
    #[serde(default)]
    jobs: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct JobResponse {
    status: String,
}

impl AstrometryNetClient {
    /// Create a new client.
    pub fn new(config: CalibrationConfig) -> Result<Self, CalibrationError> {
        let client = Client::builder()
            .user_agent(concat!("skyrecon/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CalibrationError::TransientNetwork(e.to_string()))?;

        Ok(Self {
            client,
            config,
            session: Arc::new(RwLock::new(None)),
        })
    }

    /// Get the API base URL without trailing slash.
    fn api_url(&self) -> &str {
        self.config.api_url.trim_end_matches('/')
    }

    /// Exchange the API key for a session token and cache it.
    async fn login(&self) -> Result<String, CalibrationError> {
        self.with_retries("login", || self.login_once()).await
    }

    async fn login_once(&self) -> Result<String, CalibrationError> {
        let url = format!("{}/login", self.api_url());
        let payload = json!({ "apikey": self.config.api_key }).to_string();

        let response = self
            .client
            .post(&url)
            .form(&[("request-json", payload.as_str())])
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(CalibrationError::TransientNetwork(format!("HTTP {}", status)));
        }

        let text = response.text().await.map_err(request_error)?;
        let body: LoginResponse = serde_json::from_str(&text).map_err(|e| {
            CalibrationError::MalformedResponse(format!("login response: {}", e))
        })?;

        match (body.status.as_str(), body.session) {
            ("success", Some(session)) => {
                debug!("Plate-solver login successful");
                let mut cached = self.session.write().await;
                *cached = Some(session.clone());
                Ok(session)
            }
            _ => Err(CalibrationError::Authentication(
                body.errormessage
                    .unwrap_or_else(|| format!("login rejected with status '{}'", body.status)),
            )),
        }
    }

    /// Cached session token, logging in if needed.
    async fn ensure_authenticated(&self) -> Result<String, CalibrationError> {
        let session = self.session.read().await;
        if let Some(token) = session.as_ref() {
            return Ok(token.clone());
        }
        drop(session);
        self.login().await
    }

    /// Repeat `op` while it fails with a retryable error, up to
    /// `download_attempts` tries with exponential backoff in between.
    async fn with_retries<T, F, Fut>(&self, request: &str, op: F) -> Result<T, CalibrationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CalibrationError>>,
    {
        let attempts = self.config.download_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.backoff_base(),
                        self.config.backoff_cap(),
                    );
                    warn!(
                        request,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Plate-solver request failed, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run a session-bound request, re-authenticating once if the session is rejected.
    async fn with_session<T, F, Fut>(&self, op: F) -> Result<T, CalibrationError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, CalibrationError>>,
    {
        let session = self.ensure_authenticated().await?;
        match op(session).await {
            Err(CalibrationError::Authentication(reason)) => {
                warn!(reason = %reason, "Plate-solver session rejected, re-authenticating");
                metrics::SESSION_REFRESHES.inc();
                {
                    let mut session = self.session.write().await;
                    *session = None;
                }
                let session = self.login().await?;
                op(session).await
            }
            other => other,
        }
    }

    fn upload_request_json(&self, session: &str) -> String {
        let hints = &self.config.hints;
        let mut request = Map::new();
        request.insert("session".into(), Value::from(session));
        request.insert("publicly_visible".into(), Value::from("n"));
        request.insert("allow_commercial_use".into(), Value::from("n"));

        if hints.scale_lower_arcsec.is_some() || hints.scale_upper_arcsec.is_some() {
            request.insert("scale_units".into(), Value::from("arcsecperpix"));
            request.insert("scale_type".into(), Value::from("ul"));
        }
        let optional = [
            ("scale_lower", hints.scale_lower_arcsec),
            ("scale_upper", hints.scale_upper_arcsec),
            ("center_ra", hints.center_ra),
            ("center_dec", hints.center_dec),
            ("radius", hints.radius_deg),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                request.insert(key.into(), Value::from(value));
            }
        }
        if let Some(factor) = hints.downsample_factor {
            request.insert("downsample_factor".into(), Value::from(factor));
        }

        Value::Object(request).to_string()
    }

    async fn upload_once(
        &self,
        image: &SourceImage,
        session: String,
    ) -> Result<u64, CalibrationError> {
        let url = format!("{}/upload", self.api_url());
        let file = multipart::Part::bytes(image.bytes().to_vec())
            .file_name(image.name().to_string())
            .mime_str("application/octet-stream")
            .map_err(|e| CalibrationError::UploadFailure(e.to_string()))?;
        let form = multipart::Form::new()
            .text("request-json", self.upload_request_json(&session))
            .part("file", file);

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        check_status(status).map_err(|e| match e {
            CalibrationError::TransientNetwork(_) if !status.is_server_error() => {
                CalibrationError::UploadFailure(format!("HTTP {}", status))
            }
            other => other,
        })?;

        let text = response.text().await.map_err(request_error)?;
        let body: UploadResponse = serde_json::from_str(&text).map_err(|e| {
            CalibrationError::UploadFailure(format!(
                "unparseable response ({}): {}",
                e,
                text.chars().take(100).collect::<String>()
            ))
        })?;

        if body.status == "success" {
            return body
                .subid
                .ok_or_else(|| CalibrationError::UploadFailure("missing submission id".into()));
        }

        let message = body
            .errormessage
            .unwrap_or_else(|| format!("status '{}'", body.status));
        if message.to_ascii_lowercase().contains("session") {
            Err(CalibrationError::Authentication(message))
        } else {
            Err(CalibrationError::UploadFailure(message))
        }
    }

    /// Upload image bytes, returning the submission id.
    ///
    /// Transient failures are retried; once retries run out they are
    /// reported as [`CalibrationError::UploadFailure`].
    pub async fn upload(&self, image: &SourceImage) -> Result<u64, CalibrationError> {
        self.with_session(|session| {
            self.with_retries("upload", move || self.upload_once(image, session.clone()))
        })
        .await
        .map_err(|e| match e {
            CalibrationError::TransientNetwork(reason)
            | CalibrationError::MalformedResponse(reason) => {
                CalibrationError::UploadFailure(reason)
            }
            other => other,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CalibrationError> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        check_status(response.status())?;

        let text = response.text().await.map_err(request_error)?;
        serde_json::from_str(&text).map_err(|e| {
            CalibrationError::MalformedResponse(format!(
                "{} ({}): {}",
                url,
                e,
                text.chars().take(100).collect::<String>()
            ))
        })
    }

    /// First job id assigned to a submission, if any.
    pub async fn submission_job(&self, submission_id: u64) -> Result<Option<u64>, CalibrationError> {
        let url = format!("{}/submissions/{}", self.api_url(), submission_id);
        let body: SubmissionResponse = self.get_json(&url).await?;
        Ok(body.jobs.into_iter().flatten().next())
    }

    pub async fn job_status(&self, job_id: u64) -> Result<JobStatus, CalibrationError> {
        let url = format!("{}/jobs/{}", self.api_url(), job_id);
        let body: JobResponse = self.get_json(&url).await?;
        Ok(JobStatus::from_wire(&body.status))
    }

    async fn poll_event(&self, state: &ProtocolState) -> Option<ProtocolEvent> {
        let (phase, result) = match state {
            ProtocolState::Uploaded { submission_id, .. }
            | ProtocolState::AwaitingJob { submission_id, .. } => (
                "job",
                self.submission_job(*submission_id)
                    .await
                    .map(|job_id| ProtocolEvent::SubmissionPolled { job_id }),
            ),
            ProtocolState::AwaitingSolve { job_id, .. } => (
                "solve",
                self.job_status(*job_id).await.map(ProtocolEvent::JobPolled),
            ),
            _ => return None,
        };

        let event = match result {
            Ok(event) => {
                metrics::CALIBRATION_POLLS
                    .with_label_values(&[phase, "ok"])
                    .inc();
                event
            }
            Err(e) => {
                metrics::CALIBRATION_POLLS
                    .with_label_values(&[phase, "error"])
                    .inc();
                warn!(phase, error = %e, "Calibration poll failed");
                ProtocolEvent::PollFailed {
                    error: e.to_string(),
                }
            }
        };
        Some(event)
    }

    /// Drive the protocol from upload to a terminal state.
    async fn run_protocol(
        &self,
        image: &SourceImage,
        limits: &PollLimits,
    ) -> Result<ProtocolState, CalibrationError> {
        self.ensure_authenticated().await?;
        let mut state =
            ProtocolState::Idle.advance(ProtocolEvent::Authenticated, Instant::now(), limits);

        let submission_id = self.upload(image).await?;
        info!(submission_id, image = %image.name(), "Image submitted for calibration");
        state = state.advance(
            ProtocolEvent::Uploaded { submission_id },
            Instant::now(),
            limits,
        );

        while let Some(event) = self.poll_event(&state).await {
            let was_awaiting_job = !matches!(state, ProtocolState::AwaitingSolve { .. });
            state = state.advance(event, Instant::now(), limits);

            if let ProtocolState::AwaitingSolve { job_id, .. } = &state {
                if was_awaiting_job {
                    info!(submission_id, job_id, "Calibration job assigned");
                }
            }
            if let Some(delay) = state.poll_delay(limits) {
                sleep(delay).await;
            }
        }

        Ok(state)
    }

    /// GET an artifact, retrying with exponential backoff.
    async fn download_artifact(
        &self,
        artifact: &str,
        job_id: u64,
    ) -> Result<Vec<u8>, CalibrationError> {
        let url = format!(
            "{}/{}/{}",
            self.config.resolved_site_url(),
            artifact,
            job_id
        );
        let attempts = self.config.download_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = backoff_delay(
                    attempt - 1,
                    self.config.backoff_base(),
                    self.config.backoff_cap(),
                );
                metrics::ARTIFACT_RETRIES
                    .with_label_values(&[artifact])
                    .inc();
                debug!(
                    artifact,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying artifact download"
                );
                sleep(delay).await;
            }

            match self.get_bytes(&url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    warn!(
                        artifact,
                        job_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Artifact download failed"
                    );
                    last_error = e.to_string();
                }
            }
        }

        Err(CalibrationError::ArtifactUnavailable {
            artifact: artifact.to_string(),
            attempts,
            last_error,
        })
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, CalibrationError> {
        let response = self.client.get(url).send().await.map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(CalibrationError::TransientNetwork(format!("HTTP {}", status)));
        }
        let bytes = response.bytes().await.map_err(request_error)?;
        Ok(bytes.to_vec())
    }

    /// Download and parse both artifacts of a solved job.
    async fn fetch_solution(
        &self,
        submission_id: u64,
        job_id: u64,
    ) -> Result<CalibrationSolution, CalibrationError> {
        let wcs = self.download_artifact(WCS_ARTIFACT, job_id).await?;
        let transform = CoordinateTransform::from_fits_bytes(&wcs)?;

        let (reference_sources, reference_degraded) =
            match self.download_artifact(REFERENCE_ARTIFACT, job_id).await {
                Ok(bytes) => match parse_reference_list(&bytes, &transform) {
                    Ok(list) => {
                        debug!(
                            job_id,
                            count = list.len(),
                            columns = ?list.columns,
                            "Reference list loaded"
                        );
                        (list.points, false)
                    }
                    // An unrecognised layout is fatal; a damaged file only
                    // loses the reference list.
                    Err(e @ ReferenceListError::DataShape(_)) => return Err(e.into()),
                    Err(e) => {
                        warn!(job_id, error = %e, "Reference list unreadable, continuing without it");
                        (Vec::new(), true)
                    }
                },
                Err(e) => {
                    warn!(job_id, error = %e, "Reference list unavailable, continuing without it");
                    (Vec::new(), true)
                }
            };

        Ok(CalibrationSolution {
            transform,
            reference_sources,
            submission_id,
            job_id,
            reference_degraded,
        })
    }
}

#[async_trait]
impl CalibrationService for AstrometryNetClient {
    async fn calibrate(
        &self,
        image: &SourceImage,
    ) -> Result<CalibrationOutcome, CalibrationError> {
        let started = Instant::now();
        let limits = self.config.poll_limits();

        let result = match self.run_protocol(image, &limits).await {
            Ok(ProtocolState::Solved {
                submission_id,
                job_id,
            }) => self
                .fetch_solution(submission_id, job_id)
                .await
                .map(CalibrationOutcome::Solved),
            Ok(ProtocolState::TimedOut { phase, elapsed }) => {
                warn!(?phase, elapsed_secs = elapsed.as_secs(), "Calibration timed out");
                Ok(CalibrationOutcome::TimedOut { phase, elapsed })
            }
            Ok(ProtocolState::Failed(reason)) => Err(match reason {
                FailureReason::JobFailed { job_id, status } => {
                    CalibrationError::RemoteJobFailure { job_id, status }
                }
                FailureReason::PollErrors { count, last_error } => {
                    CalibrationError::PollErrors { count, last_error }
                }
                FailureReason::UnexpectedEvent { state, event } => {
                    CalibrationError::Protocol(format!("{} in state {}", event, state))
                }
            }),
            Ok(other) => Err(CalibrationError::Protocol(format!(
                "polling stopped in non-terminal state {:?}",
                other
            ))),
            Err(e) => Err(e),
        };

        let outcome = match &result {
            Ok(CalibrationOutcome::Solved(_)) => "solved",
            Ok(CalibrationOutcome::TimedOut { .. }) => "timed_out",
            Err(_) => "failed",
        };
        metrics::CALIBRATION_OUTCOMES
            .with_label_values(&[outcome])
            .inc();
        info!(
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Calibration finished"
        );

        result
    }
}

fn check_status(status: StatusCode) -> Result<(), CalibrationError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CalibrationError::Authentication(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(CalibrationError::TransientNetwork(format!("HTTP {}", status)));
    }
    Ok(())
}

fn request_error(e: reqwest::Error) -> CalibrationError {
    if e.is_decode() {
        CalibrationError::MalformedResponse(e.to_string())
    } else {
        CalibrationError::TransientNetwork(e.to_string())
    }
}
