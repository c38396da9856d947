use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Prefix for environment overrides, e.g. `SKYRECON_CALIBRATION__API_KEY`.
pub const ENV_PREFIX: &str = "SKYRECON_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        // Keys contain underscores, so nesting uses a double underscore.
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[calibration]
api_key = "abc"

[catalog]
max_concurrent = 5
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.catalog.max_concurrent, 5);
    }

    #[test]
    fn test_load_config_from_str_missing_calibration() {
        let toml = r#"
[catalog]
max_concurrent = 5
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/skyrecon.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[calibration]
api_url = "http://127.0.0.1:3000/api"
api_key = "abc"

[matching]
sky_radius_arcsec = 12.0
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(config.calibration.api_url, "http://127.0.0.1:3000/api");
        assert_eq!(config.matching.sky_radius_arcsec, 12.0);
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "skyrecon.toml",
                r#"
[calibration]
api_key = "from-file"
"#,
            )?;
            jail.set_env("SKYRECON_CALIBRATION__API_KEY", "from-env");
            jail.set_env("SKYRECON_CATALOG__MAX_CONCURRENT", "2");

            let config = load_config(Path::new("skyrecon.toml")).unwrap();
            assert_eq!(config.calibration.api_key, "from-env");
            assert_eq!(config.catalog.max_concurrent, 2);
            Ok(())
        });
    }
}
