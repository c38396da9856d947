//! Catalog fan-out configuration.

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_VIZIER_URL: &str = "https://vizier.cds.unistra.fr/viz-bin/asu-tsv";
pub(crate) const DEFAULT_SIMBAD_URL: &str = "https://simbad.cds.unistra.fr/simbad/sim-tap/sync";
pub(crate) const DEFAULT_SKYBOT_URL: &str =
    "https://ssp.imcce.fr/webservices/skybot/api/conesearch.php";

/// Catalog aggregator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Maximum backend queries in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Position bucket size for merging results, in arcseconds.
    ///
    /// Bucketing is lossy: distinct objects closer than this may share a
    /// bucket. Keep it at or below half the sky match radius.
    #[serde(default = "default_bucket_arcsec")]
    pub bucket_arcsec: f64,

    /// Result cache lifetime in seconds (0 = no cache).
    #[serde(default)]
    pub cache_ttl_secs: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Row limit per backend query.
    #[serde(default = "default_max_rows")]
    pub max_rows: u32,

    #[serde(default)]
    pub gaia: BackendSettings,

    #[serde(default)]
    pub usno: BackendSettings,

    #[serde(default)]
    pub simbad: BackendSettings,

    #[serde(default)]
    pub skybot: BackendSettings,

    #[serde(default)]
    pub planets: BackendSettings,
}

/// Enable switch and endpoint override for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
        }
    }
}

impl BackendSettings {
    pub(crate) fn url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url.as_deref().unwrap_or(default)
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_bucket_arcsec() -> f64 {
    1.0
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_rows() -> u32 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            bucket_arcsec: default_bucket_arcsec(),
            cache_ttl_secs: 0,
            request_timeout_secs: default_request_timeout(),
            max_rows: default_max_rows(),
            gaia: BackendSettings::default(),
            usno: BackendSettings::default(),
            simbad: BackendSettings::default(),
            skybot: BackendSettings::default(),
            planets: BackendSettings::default(),
        }
    }
}
