use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationConfig;
use crate::catalog::CatalogConfig;
use crate::detection::DetectionConfig;
use crate::pipeline::{MatchingConfig, QualityConfig};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

/// Configuration safe to print or log (API key redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub calibration: SanitizedCalibrationConfig,
    pub detection: DetectionConfig,
    pub quality: QualityConfig,
    pub matching: MatchingConfig,
    pub catalog: CatalogConfig,
}

/// Sanitized calibration config (API key hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCalibrationConfig {
    pub api_url: String,
    pub site_url: String,
    pub api_key_configured: bool,
    pub job_poll_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub solve_poll_interval_secs: u64,
    pub solve_timeout_secs: u64,
    pub download_attempts: u32,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        let calibration = &config.calibration;
        Self {
            calibration: SanitizedCalibrationConfig {
                api_url: calibration.api_url.clone(),
                site_url: calibration.resolved_site_url(),
                api_key_configured: !calibration.api_key.is_empty(),
                job_poll_interval_secs: calibration.job_poll_interval_secs,
                job_timeout_secs: calibration.job_timeout_secs,
                solve_poll_interval_secs: calibration.solve_poll_interval_secs,
                solve_timeout_secs: calibration.solve_timeout_secs,
                download_attempts: calibration.download_attempts,
            },
            detection: config.detection.clone(),
            quality: config.quality.clone(),
            matching: config.matching.clone(),
            catalog: config.catalog.clone(),
        }
    }
}
