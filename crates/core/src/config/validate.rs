use super::{types::Config, ConfigError};

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn positive(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(format!("{} must be positive, got {}", name, value)))
    }
}

fn non_zero(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(format!("{} cannot be 0", name)));
    }
    Ok(())
}

/// Validate configuration
/// Currently validates:
/// - Calibration API key is set, intervals/timeouts/attempts are non-zero
/// - Match radii are positive and the catalog bucket is at most half the
///   sky match radius
/// - Quality thresholds are in range
/// - Catalog concurrency is non-zero
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Calibration
    let calibration = &config.calibration;
    if calibration.api_key.trim().is_empty() {
        return Err(invalid("calibration.api_key cannot be empty"));
    }
    non_zero(
        "calibration.job_poll_interval_secs",
        calibration.job_poll_interval_secs,
    )?;
    non_zero("calibration.job_timeout_secs", calibration.job_timeout_secs)?;
    non_zero(
        "calibration.solve_poll_interval_secs",
        calibration.solve_poll_interval_secs,
    )?;
    non_zero("calibration.solve_timeout_secs", calibration.solve_timeout_secs)?;
    non_zero(
        "calibration.download_attempts",
        calibration.download_attempts.into(),
    )?;
    non_zero(
        "calibration.max_consecutive_poll_errors",
        calibration.max_consecutive_poll_errors.into(),
    )?;
    if calibration.backoff_base_secs > calibration.backoff_cap_secs {
        return Err(invalid(
            "calibration.backoff_base_secs cannot exceed backoff_cap_secs",
        ));
    }

    // Detection
    positive("detection.threshold_sigma", config.detection.threshold_sigma.into())?;
    positive("detection.aperture_radius", config.detection.aperture_radius)?;
    if config.detection.background_cell == 0 {
        return Err(invalid("detection.background_cell cannot be 0"));
    }

    // Quality
    let quality = &config.quality;
    if !(0.0..=1.0).contains(&quality.flux_multiplier) {
        return Err(invalid(format!(
            "quality.flux_multiplier must be within [0, 1], got {}",
            quality.flux_multiplier
        )));
    }
    if quality.max_axis_ratio.is_nan() || quality.max_axis_ratio < 1.0 {
        return Err(invalid(format!(
            "quality.max_axis_ratio must be at least 1, got {}",
            quality.max_axis_ratio
        )));
    }
    if quality.border_margin < 0.0 {
        return Err(invalid("quality.border_margin cannot be negative"));
    }

    // Matching
    let matching = &config.matching;
    positive("matching.pixel_radius", matching.pixel_radius)?;
    positive("matching.sky_radius_arcsec", matching.sky_radius_arcsec)?;
    if matching.region_margin_arcsec < 0.0 {
        return Err(invalid("matching.region_margin_arcsec cannot be negative"));
    }

    // Catalog
    let catalog = &config.catalog;
    if catalog.max_concurrent == 0 {
        return Err(invalid("catalog.max_concurrent cannot be 0"));
    }
    positive("catalog.bucket_arcsec", catalog.bucket_arcsec)?;
    if catalog.bucket_arcsec > matching.sky_radius_arcsec / 2.0 {
        return Err(invalid(format!(
            "catalog.bucket_arcsec ({}) must not exceed half of matching.sky_radius_arcsec ({})",
            catalog.bucket_arcsec, matching.sky_radius_arcsec
        )));
    }
    non_zero("catalog.request_timeout_secs", catalog.request_timeout_secs)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn valid_config() -> Config {
        load_config_from_str("[calibration]\napi_key = \"abc\"").unwrap()
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_validate_empty_api_key_fails() {
        let mut config = valid_config();
        config.calibration.api_key = "  ".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_validate_zero_poll_interval_fails() {
        let mut config = valid_config();
        config.calibration.solve_poll_interval_secs = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_radii() {
        let mut config = valid_config();
        config.matching.pixel_radius = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.matching.sky_radius_arcsec = -1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_bucket_against_sky_radius() {
        let mut config = valid_config();
        config.matching.sky_radius_arcsec = 4.0;
        config.catalog.bucket_arcsec = 2.0;
        assert!(validate_config(&config).is_ok());

        config.catalog.bucket_arcsec = 2.5;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("bucket_arcsec"));
    }

    #[test]
    fn test_validate_quality_ranges() {
        let mut config = valid_config();
        config.quality.flux_multiplier = 1.5;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.quality.max_axis_ratio = 0.5;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.quality.max_axis_ratio = f64::NAN;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_concurrency_fails() {
        let mut config = valid_config();
        config.catalog.max_concurrent = 0;
        assert!(validate_config(&config).is_err());
    }
}
