//! Sky positions and spherical geometry helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ARCSEC_PER_DEG: f64 = 3600.0;

/// A position on the celestial sphere (ICRS degrees).
///
/// Always derived from pixel coordinates plus a calibration, or reported by a
/// catalog. The optional timestamp matters for solar-system lookups only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkyPosition {
    pub ra_deg: f64,
    pub dec_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl SkyPosition {
    /// Create a position, wrapping right ascension into `[0, 360)`.
    pub fn new(ra_deg: f64, dec_deg: f64) -> Self {
        Self {
            ra_deg: ra_deg.rem_euclid(360.0),
            dec_deg,
            observed_at: None,
        }
    }

    /// Attach an observation timestamp.
    pub fn at(mut self, observed_at: Option<DateTime<Utc>>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Cartesian unit vector for this position.
    pub fn unit_vector(&self) -> [f64; 3] {
        let ra = self.ra_deg.to_radians();
        let dec = self.dec_deg.to_radians();
        [dec.cos() * ra.cos(), dec.cos() * ra.sin(), dec.sin()]
    }

    /// Inverse of [`SkyPosition::unit_vector`]; the vector need not be normalized.
    pub fn from_vector(v: [f64; 3]) -> Self {
        let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        let dec = (v[2] / norm).clamp(-1.0, 1.0).asin();
        let ra = v[1].atan2(v[0]);
        Self::new(ra.to_degrees(), dec.to_degrees())
    }

    /// Great-circle separation in arcseconds (Vincenty formula, stable at all scales).
    pub fn separation_arcsec(&self, other: &SkyPosition) -> f64 {
        let (ra1, dec1) = (self.ra_deg.to_radians(), self.dec_deg.to_radians());
        let (ra2, dec2) = (other.ra_deg.to_radians(), other.dec_deg.to_radians());
        let dra = ra2 - ra1;

        let (sin_d1, cos_d1) = dec1.sin_cos();
        let (sin_d2, cos_d2) = dec2.sin_cos();

        let t1 = cos_d2 * dra.sin();
        let t2 = cos_d1 * sin_d2 - sin_d1 * cos_d2 * dra.cos();
        let num = (t1 * t1 + t2 * t2).sqrt();
        let den = sin_d1 * sin_d2 + cos_d1 * cos_d2 * dra.cos();

        num.atan2(den).to_degrees() * ARCSEC_PER_DEG
    }
}

/// Chord length between two unit vectors separated by `arcsec`.
pub fn chord_from_arcsec(arcsec: f64) -> f64 {
    2.0 * ((arcsec / ARCSEC_PER_DEG).to_radians() * 0.5).sin()
}

/// Angular separation in arcseconds for a chord length between unit vectors.
pub fn arcsec_from_chord(chord: f64) -> f64 {
    2.0 * (chord * 0.5).clamp(-1.0, 1.0).asin().to_degrees() * ARCSEC_PER_DEG
}

/// Spherical centroid: normalized mean of the unit vectors.
///
/// Returns `None` for an empty slice or when the vectors cancel out.
pub fn centroid(positions: &[SkyPosition]) -> Option<SkyPosition> {
    if positions.is_empty() {
        return None;
    }
    let mut sum = [0.0f64; 3];
    for p in positions {
        let v = p.unit_vector();
        sum[0] += v[0];
        sum[1] += v[1];
        sum[2] += v[2];
    }
    let norm = (sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2]).sqrt();
    if norm < 1e-12 {
        return None;
    }
    Some(SkyPosition::from_vector(sum))
}

/// Format right ascension as `HHhMMmSS.SSs`.
pub fn format_ra(ra_deg: f64) -> String {
    const HUNDREDTHS_PER_DAY: i64 = 24 * 3600 * 100;
    let total = ((ra_deg.rem_euclid(360.0) / 15.0) * 3600.0 * 100.0).round() as i64;
    let total = total.rem_euclid(HUNDREDTHS_PER_DAY);

    let hours = total / 360_000;
    let minutes = (total / 6_000) % 60;
    let seconds = (total % 6_000) as f64 / 100.0;
    format!("{:02}h{:02}m{:05.2}s", hours, minutes, seconds)
}

/// Format declination as `±DD°MM'SS.S"`.
pub fn format_dec(dec_deg: f64) -> String {
    let sign = if dec_deg < 0.0 { '-' } else { '+' };
    let total = (dec_deg.abs() * 3600.0 * 10.0).round() as i64;

    let degrees = total / 36_000;
    let minutes = (total / 600) % 60;
    let seconds = (total % 600) as f64 / 10.0;
    format!("{}{:02}°{:02}'{:04.1}\"", sign, degrees, minutes, seconds)
}

/// Parse a sexagesimal triple such as `"12 34 56.7"` or `"-05 23 27.6"`.
///
/// The sign applies to the whole value, including `-00 ...`.
pub fn parse_sexagesimal(text: &str) -> Option<f64> {
    let text = text.trim();
    let negative = text.starts_with('-');
    let parts: Vec<f64> = text
        .trim_start_matches(['+', '-'])
        .split([' ', ':'])
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>())
        .collect::<Result<_, _>>()
        .ok()?;

    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let value = parts
        .iter()
        .enumerate()
        .map(|(i, v)| v / 60f64.powi(i as i32))
        .sum::<f64>();
    Some(if negative { -value } else { value })
}
