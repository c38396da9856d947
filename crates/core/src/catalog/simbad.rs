//! SIMBAD TAP cone search.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::config::DEFAULT_SIMBAD_URL;
use super::{CatalogBackend, CatalogConfig, CatalogEntry, CatalogError, CatalogTag, SkyRegion};
use crate::sky::SkyPosition;

/// SIMBAD object database (galaxies, nebulae, variable stars, ...).
pub struct SimbadBackend {
    client: Client,
    base_url: String,
    max_rows: u32,
}

#[derive(Debug, Deserialize)]
struct TapResponse {
    metadata: Vec<TapColumn>,
    data: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct TapColumn {
    name: String,
}

impl SimbadBackend {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.simbad.url_or(DEFAULT_SIMBAD_URL).to_string(),
            max_rows: config.max_rows,
        })
    }
}

/// ADQL cone query against the `basic` table.
fn cone_query(region: &SkyRegion, max_rows: u32) -> String {
    let ra = region.center.ra_deg;
    let dec = region.center.dec_deg;
    format!(
        "SELECT TOP {max_rows} main_id, ra, dec, otype, \
         DISTANCE(POINT('ICRS', ra, dec), POINT('ICRS', {ra:.6}, {dec:.6})) AS dist \
         FROM basic \
         WHERE CONTAINS(POINT('ICRS', ra, dec), CIRCLE('ICRS', {ra:.6}, {dec:.6}, {radius:.6})) = 1 \
         ORDER BY dist",
        radius = region.radius_deg(),
    )
}

fn parse_tap(body: &str) -> Result<Vec<CatalogEntry>, CatalogError> {
    let response: TapResponse = serde_json::from_str(body)
        .map_err(|e| CatalogError::Parse(format!("SIMBAD TAP response: {}", e)))?;

    let index = |name: &str| response.metadata.iter().position(|c| c.name == name);
    let (Some(ra_idx), Some(dec_idx)) = (index("ra"), index("dec")) else {
        return Err(CatalogError::Parse("SIMBAD response lacks ra/dec".to_string()));
    };

    let entries = response
        .data
        .iter()
        .filter_map(|row| {
            let ra = row.get(ra_idx)?.as_f64()?;
            let dec = row.get(dec_idx)?.as_f64()?;
            let payload: Map<String, Value> = response
                .metadata
                .iter()
                .zip(row)
                .map(|(column, value)| (column.name.clone(), value.clone()))
                .collect();
            Some(CatalogEntry::new(
                CatalogTag::Simbad,
                SkyPosition::new(ra, dec),
                Value::Object(payload),
            ))
        })
        .collect();

    Ok(entries)
}

#[async_trait]
impl CatalogBackend for SimbadBackend {
    fn tag(&self) -> CatalogTag {
        CatalogTag::Simbad
    }

    async fn query(&self, region: &SkyRegion) -> Result<Vec<CatalogEntry>, CatalogError> {
        let adql = cone_query(region, self.max_rows);
        debug!(query = %adql, "SIMBAD TAP query");

        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("REQUEST", "doQuery"),
                ("LANG", "ADQL"),
                ("FORMAT", "json"),
                ("QUERY", adql.as_str()),
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
        parse_tap(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cone_query() {
        let region = SkyRegion::new(SkyPosition::new(83.82, -5.39), 36.0, None);
        let adql = cone_query(&region, 100);
        assert!(adql.starts_with("SELECT TOP 100 main_id, ra, dec, otype"));
        assert!(adql.contains("CIRCLE('ICRS', 83.820000, -5.390000, 0.010000)"));
        assert!(adql.contains("FROM basic"));
    }

    #[test]
    fn test_parse_tap_json() {
        let body = r#"{
            "metadata": [
                {"name": "main_id", "datatype": "char"},
                {"name": "ra", "datatype": "double"},
                {"name": "dec", "datatype": "double"},
                {"name": "otype", "datatype": "char"}
            ],
            "data": [
                ["M  42", 83.82208, -5.39111, "HII"],
                ["NGC  1977", null, null, "RNe"]
            ]
        }"#;
        let entries = parse_tap(body).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name(), Some("M  42"));
        assert_eq!(entries[0].payload["otype"], "HII");
        assert!((entries[0].position.dec_deg + 5.39111).abs() < 1e-9);
    }

    #[test]
    fn test_parse_tap_rejects_garbage() {
        assert!(matches!(parse_tap("<VOTABLE/>"), Err(CatalogError::Parse(_))));
        assert!(matches!(
            parse_tap(r#"{"metadata": [{"name": "main_id"}], "data": []}"#),
            Err(CatalogError::Parse(_))
        ));
    }
}
