//! IMCCE SkyBoT cone search for minor planets and comets.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::json;
use tracing::debug;

use super::config::DEFAULT_SKYBOT_URL;
use super::{CatalogBackend, CatalogConfig, CatalogEntry, CatalogError, CatalogTag, SkyRegion};
use crate::sky::{parse_sexagesimal, SkyPosition};

/// Julian date of the Unix epoch.
const UNIX_EPOCH_JD: f64 = 2_440_587.5;

/// Geocentric observer code.
const GEOCENTER: &str = "500";

/// Minor bodies from SkyBoT. Needs an observation time.
pub struct SkybotBackend {
    client: Client,
    base_url: String,
}

impl SkybotBackend {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.skybot.url_or(DEFAULT_SKYBOT_URL).to_string(),
        })
    }
}

pub(crate) fn julian_date(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 86_400_000.0 + UNIX_EPOCH_JD
}

/// Parse the pipe-separated text output.
///
/// Columns: `Num | Name | RA(h) | DE(deg) | Class | Mv | Err(arcsec) | d(arcsec)`.
fn parse_text(body: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut entries = Vec::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        if fields.len() < 6 {
            return Err(CatalogError::Parse(format!(
                "unexpected SkyBoT row: {}",
                line.chars().take(100).collect::<String>()
            )));
        }
        let (Some(ra_hours), Some(dec)) =
            (parse_sexagesimal(fields[2]), parse_sexagesimal(fields[3]))
        else {
            return Err(CatalogError::Parse(format!(
                "bad SkyBoT position in row: {}",
                line
            )));
        };

        let payload = json!({
            "number": fields[0],
            "name": fields[1],
            "class": fields[4],
            "magnitude": fields[5].parse::<f64>().ok(),
            "error_arcsec": fields.get(6).and_then(|v| v.parse::<f64>().ok()),
            "distance_arcsec": fields.get(7).and_then(|v| v.parse::<f64>().ok()),
        });
        entries.push(CatalogEntry::new(
            CatalogTag::MinorPlanet,
            SkyPosition::new(ra_hours * 15.0, dec),
            payload,
        ));
    }
    Ok(entries)
}

#[async_trait]
impl CatalogBackend for SkybotBackend {
    fn tag(&self) -> CatalogTag {
        CatalogTag::MinorPlanet
    }

    fn requires_observation_time(&self) -> bool {
        true
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError> {
        let observed_at = region
            .observed_at
            .ok_or(CatalogError::MissingObservationTime)?;
        let epoch = format!("{:.6}", julian_date(observed_at));
        let ra = format!("{:.6}", region.center.ra_deg);
        let dec = format!("{:.6}", region.center.dec_deg);
        let radius = format!("{:.6}", region.radius_deg());

        debug!(epoch = %epoch, ra = %ra, dec = %dec, "SkyBoT cone search");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("-ep", epoch.as_str()),
                ("-ra", ra.as_str()),
                ("-dec", dec.as_str()),
                ("-rd", radius.as_str()),
                ("-mime", "text"),
                ("-output", "object"),
                ("-loc", GEOCENTER),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Api {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body = response.text().await?;
        parse_text(&body)
    }
}
