//! Calibration service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::PollLimits;

/// Connection and polling settings for the plate-solving service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// API base URL (login, upload, status endpoints).
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Site URL serving result artifacts. Derived from `api_url` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,

    #[serde(default)]
    pub api_key: String,

    /// Seconds between submission status polls.
    #[serde(default = "default_poll_interval")]
    pub job_poll_interval_secs: u64,

    /// Give up waiting for a job id after this many seconds.
    #[serde(default = "default_poll_timeout")]
    pub job_timeout_secs: u64,

    /// Seconds between job status polls.
    #[serde(default = "default_poll_interval")]
    pub solve_poll_interval_secs: u64,

    /// Give up waiting for a solve after this many seconds.
    #[serde(default = "default_poll_timeout")]
    pub solve_timeout_secs: u64,

    /// Consecutive failed or malformed polls tolerated before giving up.
    #[serde(default = "default_max_poll_errors")]
    pub max_consecutive_poll_errors: u32,

    /// Attempts per request for retryable failures (downloads, login, upload).
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub hints: UploadHints,
}

/// Optional solver hints sent with the upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_lower_arcsec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_upper_arcsec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_ra: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center_dec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downsample_factor: Option<u32>,
}

fn default_api_url() -> String {
    "https://nova.astrometry.net/api".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    300
}

fn default_max_poll_errors() -> u32 {
    3
}

fn default_download_attempts() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    5
}

fn default_backoff_cap() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            site_url: None,
            api_key: String::new(),
            job_poll_interval_secs: default_poll_interval(),
            job_timeout_secs: default_poll_timeout(),
            solve_poll_interval_secs: default_poll_interval(),
            solve_timeout_secs: default_poll_timeout(),
            max_consecutive_poll_errors: default_max_poll_errors(),
            download_attempts: default_download_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            request_timeout_secs: default_request_timeout(),
            hints: UploadHints::default(),
        }
    }
}

impl CalibrationConfig {
    /// Artifact site URL: explicit setting, or `api_url` without its `/api` suffix.
    pub fn resolved_site_url(&self) -> String {
        match &self.site_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => {
                let api = self.api_url.trim_end_matches('/');
                api.strip_suffix("/api").unwrap_or(api).to_string()
            }
        }
    }

    pub fn poll_limits(&self) -> PollLimits {
        PollLimits {
            job_poll_interval: Duration::from_secs(self.job_poll_interval_secs),
            job_timeout: Duration::from_secs(self.job_timeout_secs),
            solve_poll_interval: Duration::from_secs(self.solve_poll_interval_secs),
            solve_timeout: Duration::from_secs(self.solve_timeout_secs),
            max_consecutive_poll_errors: self.max_consecutive_poll_errors,
        }
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}
