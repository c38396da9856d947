//! Source image handed to both the calibration and detection branches.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::fits::{self, Header};

/// Immutable image bytes shared between concurrent consumers.
#[derive(Debug, Clone)]
pub struct SourceImage {
    name: String,
    bytes: Arc<[u8]>,
}

impl SourceImage {
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());
        Ok(Self::from_bytes(name, bytes))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_fits(&self) -> bool {
        fits::is_fits(&self.bytes)
    }

    /// `DATE-OBS` from a FITS primary header, interpreted as UTC.
    pub fn observation_time(&self) -> Option<DateTime<Utc>> {
        if !self.is_fits() {
            return None;
        }
        let (header, _) = Header::parse(&self.bytes).ok()?;
        parse_date_obs(header.text("DATE-OBS")?)
    }
}

fn parse_date_obs(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim().trim_end_matches('Z');
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
