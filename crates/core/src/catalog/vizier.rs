//! VizieR cone search (`asu-tsv`) for the stellar catalogs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Map, Value};
use tracing::debug;

use super::config::{BackendSettings, DEFAULT_VIZIER_URL};
use super::{CatalogBackend, CatalogConfig, CatalogEntry, CatalogError, CatalogTag, SkyRegion};
use crate::sky::{parse_sexagesimal, SkyPosition};

/// Table layout of one VizieR catalog.
#[derive(Debug, Clone, Copy)]
struct VizierTable {
    source: &'static str,
    ra_column: &'static str,
    dec_column: &'static str,
    columns: &'static [&'static str],
}

const GAIA_DR3: VizierTable = VizierTable {
    source: "I/355/gaiadr3",
    ra_column: "RA_ICRS",
    dec_column: "DE_ICRS",
    columns: &["Source", "RA_ICRS", "DE_ICRS", "Gmag", "BPmag", "RPmag", "pmRA", "pmDE"],
};

const USNO_B1: VizierTable = VizierTable {
    source: "I/284/out",
    ra_column: "RAJ2000",
    dec_column: "DEJ2000",
    columns: &["USNO-B1.0", "RAJ2000", "DEJ2000", "B1mag", "R1mag", "B2mag", "R2mag"],
};

/// VizieR-hosted stellar catalog.
pub struct VizierBackend {
    client: Client,
    base_url: String,
    tag: CatalogTag,
    table: VizierTable,
    max_rows: u32,
}

impl VizierBackend {
    pub fn gaia_dr3(config: &CatalogConfig) -> Result<Self, CatalogError> {
        Self::new(config, &config.gaia, CatalogTag::GaiaDr3, GAIA_DR3)
    }

    pub fn usno_b1(config: &CatalogConfig) -> Result<Self, CatalogError> {
        Self::new(config, &config.usno, CatalogTag::UsnoB1, USNO_B1)
    }

    fn new(
        config: &CatalogConfig,
        settings: &BackendSettings,
        tag: CatalogTag,
        table: VizierTable,
    ) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: settings.url_or(DEFAULT_VIZIER_URL).to_string(),
            tag,
            table,
            max_rows: config.max_rows,
        })
    }
}

#[async_trait]
impl CatalogBackend for VizierBackend {
    fn tag(&self) -> CatalogTag {
        self.tag
    }

    fn row_limit(&self) -> Option<usize> {
        Some(self.max_rows as usize)
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError> {
        let center = format!("{:.6} {:+.6}", region.center.ra_deg, region.center.dec_deg);
        let radius = format!("{:.3}", region.radius_arcsec);
        let max_rows = self.max_rows.to_string();
        let columns = self.table.columns.join(",");

        debug!(
            source = self.table.source,
            center = %center,
            radius_arcsec = region.radius_arcsec,
            "VizieR cone search"
        );

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("-source", self.table.source),
                ("-c", center.as_str()),
                ("-c.rs", radius.as_str()),
                ("-out.max", max_rows.as_str()),
                // Nearest first, so a capped result drops the field edges.
                ("-sort", "_r"),
                ("-out", columns.as_str()),
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
        parse_tsv(&body, self.tag, &self.table)
    }
}

/// Parse VizieR `asu-tsv` output: comments, header, units, dashes, rows.
fn parse_tsv(
    body: &str,
    tag: CatalogTag,
    table: &VizierTable,
) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut lines = body.lines().filter(|l| !l.starts_with('#'));

    // Skip leading blank lines; no header means no rows.
    let Some(header) = lines.by_ref().find(|l| !l.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    let names: Vec<&str> = header.split('\t').map(str::trim).collect();
    let index = |name: &str| names.iter().position(|n| *n == name);
    let (Some(ra_idx), Some(dec_idx)) = (index(table.ra_column), index(table.dec_column)) else {
        return Err(CatalogError::Parse(format!(
            "missing {}/{} in header {:?}",
            table.ra_column, table.dec_column, names
        )));
    };

    let mut entries = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            // Tables are separated by blank lines; only the first is used.
            if !entries.is_empty() {
                break;
            }
            continue;
        }
        // Units line and the dashes separator.
        if line.trim_start().starts_with('-') && line.chars().all(|c| c == '-' || c == '\t' || c == ' ') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        if fields.len() != names.len() {
            continue;
        }

        let (Some(ra), Some(dec)) = (
            parse_angle(fields[ra_idx], true),
            parse_angle(fields[dec_idx], false),
        ) else {
            continue;
        };

        let mut payload = Map::new();
        for (name, raw) in names.iter().zip(&fields) {
            payload.insert((*name).to_string(), cell_value(raw));
        }
        entries.push(CatalogEntry::new(
            tag,
            SkyPosition::new(ra, dec),
            Value::Object(payload),
        ));
    }

    Ok(entries)
}

/// Decimal degrees, or sexagesimal (hours for RA).
fn parse_angle(raw: &str, is_ra: bool) -> Option<f64> {
    if let Ok(deg) = raw.parse::<f64>() {
        return Some(deg);
    }
    let value = parse_sexagesimal(raw)?;
    Some(if is_ra { value * 15.0 } else { value })
}

fn cell_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    match raw.parse::<f64>() {
        Ok(f) if f.is_finite() => Value::from(f),
        _ => Value::from(raw),
    }
}
