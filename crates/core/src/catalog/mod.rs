//! Astronomical catalog backends and the concurrent aggregator.
//!
//! Each [`CatalogBackend`] answers a cone query for one catalog. The
//! [`CatalogAggregator`] fans a single region query out to all backends,
//! tolerates individual failures and merges results into position buckets.

mod aggregator;
mod cache;
mod config;
mod ephemeris;
mod simbad;
mod skybot;
mod vizier;

pub use aggregator::{AggregatedCatalog, BackendFailure, CatalogAggregator, PositionKey};
pub use cache::QueryCache;
pub use config::CatalogConfig;
pub use ephemeris::{Planet, PlanetEphemeris};
pub use simbad::SimbadBackend;
pub use skybot::SkybotBackend;
pub use vizier::VizierBackend;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sky::SkyPosition;

/// Catalog a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogTag {
    /// Gaia DR3 stellar catalog.
    GaiaDr3,
    /// USNO-B1.0 stellar catalog.
    UsnoB1,
    /// SIMBAD non-stellar / general object database.
    Simbad,
    /// Minor planets and comets (SkyBoT).
    MinorPlanet,
    /// Major solar-system bodies.
    SolarSystem,
}

impl CatalogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogTag::GaiaDr3 => "gaia_dr3",
            CatalogTag::UsnoB1 => "usno_b1",
            CatalogTag::Simbad => "simbad",
            CatalogTag::MinorPlanet => "minor_planet",
            CatalogTag::SolarSystem => "solar_system",
        }
    }
}

impl fmt::Display for CatalogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog row: where it is, which catalog, and the raw columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tag: CatalogTag,
    pub position: SkyPosition,
    /// Backend-specific columns, passed through untouched.
    pub payload: serde_json::Value,
}

impl CatalogEntry {
    pub fn new(tag: CatalogTag, position: SkyPosition, payload: serde_json::Value) -> Self {
        Self {
            tag,
            position,
            payload,
        }
    }

    /// Best-effort display name taken from the payload.
    pub fn name(&self) -> Option<&str> {
        ["name", "main_id", "Source", "USNO-B1.0", "Name"]
            .iter()
            .find_map(|key| self.payload.get(*key).and_then(|v| v.as_str()))
    }
}

/// A cone on the sky, optionally at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyRegion {
    pub center: SkyPosition,
    pub radius_arcsec: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl SkyRegion {
    pub fn new(center: SkyPosition, radius_arcsec: f64, observed_at: Option<DateTime<Utc>>) -> Self {
        Self {
            center,
            radius_arcsec,
            observed_at,
        }
    }

    pub fn radius_deg(&self) -> f64 {
        self.radius_arcsec / crate::sky::ARCSEC_PER_DEG
    }

    pub fn contains(&self, position: &SkyPosition) -> bool {
        self.center.separation_arcsec(position) <= self.radius_arcsec
    }
}

/// Errors from a single catalog backend.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend returned an error status.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Backend needs an observation time and none was given.
    #[error("Observation time required")]
    MissingObservationTime,

    /// Backend task panicked or was cancelled.
    #[error("Backend task aborted: {0}")]
    Aborted(String),
}

impl CatalogError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::Http(e) => e.is_timeout() || e.is_connect(),
            CatalogError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A queryable catalog.
#[async_trait]
pub trait CatalogBackend: Send + Sync {
    fn tag(&self) -> CatalogTag;

    /// Time-dependent backends are skipped when no observation time is known.
    fn requires_observation_time(&self) -> bool {
        false
    }

    /// Maximum rows the service returns per query, if it caps results.
    /// A result of this size may be missing entries.
    fn row_limit(&self) -> Option<usize> {
        None
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError>;
}

/// Capability: everything known about a region of sky.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn query_region(&self, region: &SkyRegion) -> AggregatedCatalog;
}

/// Build the enabled production backends from configuration.
pub fn build_backends(
    config: &CatalogConfig,
) -> Result<Vec<Arc<dyn CatalogBackend>>, CatalogError> {
    let mut backends: Vec<Arc<dyn CatalogBackend>> = Vec::new();
    if config.gaia.enabled {
        backends.push(Arc::new(VizierBackend::gaia_dr3(config)?));
    }
    if config.usno.enabled {
        backends.push(Arc::new(VizierBackend::usno_b1(config)?));
    }
    if config.simbad.enabled {
        backends.push(Arc::new(SimbadBackend::new(config)?));
    }
    if config.skybot.enabled {
        backends.push(Arc::new(SkybotBackend::new(config)?));
    }
    if config.planets.enabled {
        backends.push(Arc::new(PlanetEphemeris::new()));
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_display() {
        assert_eq!(CatalogTag::GaiaDr3.to_string(), "gaia_dr3");
        assert_eq!(
            serde_json::to_value(CatalogTag::MinorPlanet).unwrap(),
            json!("minor_planet")
        );
    }

    #[test]
    fn test_entry_name() {
        let entry = CatalogEntry::new(
            CatalogTag::Simbad,
            SkyPosition::new(10.0, 10.0),
            json!({"main_id": "M 42", "otype": "HII"}),
        );
        assert_eq!(entry.name(), Some("M 42"));

        let anonymous = CatalogEntry::new(CatalogTag::GaiaDr3, SkyPosition::new(0.0, 0.0), json!({}));
        assert_eq!(anonymous.name(), None);
    }

    #[test]
    fn test_region_contains() {
        let region = SkyRegion::new(SkyPosition::new(10.0, 0.0), 60.0, None);
        assert!(region.contains(&SkyPosition::new(10.0, 59.0 / 3600.0)));
        assert!(!region.contains(&SkyPosition::new(10.0, 61.0 / 3600.0)));
        assert!((region.radius_deg() - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_build_backends_respects_switches() {
        let mut config = CatalogConfig::default();
        config.simbad.enabled = false;
        config.skybot.enabled = false;
        let tags: Vec<CatalogTag> = build_backends(&config)
            .unwrap()
            .iter()
            .map(|b| b.tag())
            .collect();
        assert_eq!(
            tags,
            vec![CatalogTag::GaiaDr3, CatalogTag::UsnoB1, CatalogTag::SolarSystem]
        );
    }
}
