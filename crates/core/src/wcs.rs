//! Pixel <-> sky coordinate transform (gnomonic projection with optional SIP
//! distortion), as produced by the calibration service.
//!
//! Pixel coordinates in this API are 0-based (`(0, 0)` is the centre of the
//! first pixel). FITS keywords use 1-based pixels; the offset is applied
//! internally.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fits::{self, FitsError, Header};
use crate::sky::SkyPosition;

const SIP_MAX_ITERATIONS: usize = 50;
const SIP_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Error)]
pub enum WcsError {
    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Singular CD matrix")]
    SingularMatrix,

    #[error("Non-finite coordinate")]
    NonFinite,

    #[error("Position lies behind the tangent plane")]
    BehindTangentPlane,

    #[error("SIP inversion did not converge")]
    NotConverged,
}

/// SIP polynomial: `sum(coeff * u^p * v^q)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipPolynomial {
    pub terms: Vec<(u32, u32, f64)>,
}

impl SipPolynomial {
    fn from_header(header: &Header, prefix: &str) -> Option<Self> {
        let order = header.integer(&format!("{}_ORDER", prefix))?;
        let order = u32::try_from(order).ok()?;
        let mut terms = Vec::new();
        for p in 0..=order {
            for q in 0..=(order - p) {
                if let Some(c) = header.float(&format!("{}_{}_{}", prefix, p, q)) {
                    if c != 0.0 {
                        terms.push((p, q, c));
                    }
                }
            }
        }
        Some(Self { terms })
    }

    pub fn eval(&self, u: f64, v: f64) -> f64 {
        self.terms
            .iter()
            .map(|&(p, q, c)| c * u.powi(p as i32) * v.powi(q as i32))
            .sum()
    }
}

/// SIP distortion: forward (`A`, `B`) and optional inverse (`AP`, `BP`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SipDistortion {
    pub a: SipPolynomial,
    pub b: SipPolynomial,
    pub ap: Option<SipPolynomial>,
    pub bp: Option<SipPolynomial>,
}

/// Bidirectional pixel/sky mapping, valid only for the image it was fit to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinateTransform {
    /// Reference pixel (FITS 1-based convention).
    crpix: [f64; 2],
    /// Reference sky position in degrees.
    crval: [f64; 2],
    /// Linear transform, degrees per pixel.
    cd: [[f64; 2]; 2],
    cd_inv: [[f64; 2]; 2],
    sip: Option<SipDistortion>,
    image_size: Option<(u32, u32)>,
}

impl CoordinateTransform {
    /// Pure TAN transform. `crpix` uses the FITS 1-based convention.
    pub fn tan(crpix: [f64; 2], crval: [f64; 2], cd: [[f64; 2]; 2]) -> Result<Self, WcsError> {
        let cd_inv = cd_inverse(&cd).ok_or(WcsError::SingularMatrix)?;
        Ok(Self {
            crpix,
            crval,
            cd,
            cd_inv,
            sip: None,
            image_size: None,
        })
    }

    pub fn with_sip(mut self, sip: SipDistortion) -> Self {
        self.sip = Some(sip);
        self
    }

    pub fn with_image_size(mut self, width: u32, height: u32) -> Self {
        self.image_size = Some((width, height));
        self
    }

    /// Parse a transform from a FITS header.
    ///
    /// Accepts a `CD` matrix, or `CDELT` combined with `PC` or `CROTA2`.
    pub fn from_header(header: &Header) -> Result<Self, WcsError> {
        for (axis, expected) in [("CTYPE1", "RA---TAN"), ("CTYPE2", "DEC--TAN")] {
            let ctype = header
                .text(axis)
                .ok_or_else(|| FitsError::MissingKeyword(axis.to_string()))?;
            if !ctype.starts_with(expected) {
                return Err(WcsError::UnsupportedProjection(ctype.to_string()));
            }
        }

        let crpix = [
            header.required_float("CRPIX1")?,
            header.required_float("CRPIX2")?,
        ];
        let crval = [
            header.required_float("CRVAL1")?,
            header.required_float("CRVAL2")?,
        ];
        let cd = linear_matrix(header)?;

        let mut transform = Self::tan(crpix, crval, cd)?;

        if let (Some(a), Some(b)) = (
            SipPolynomial::from_header(header, "A"),
            SipPolynomial::from_header(header, "B"),
        ) {
            transform.sip = Some(SipDistortion {
                a,
                b,
                ap: SipPolynomial::from_header(header, "AP"),
                bp: SipPolynomial::from_header(header, "BP"),
            });
        }

        let width = header.integer("IMAGEW").or_else(|| header.integer("NAXIS1"));
        let height = header.integer("IMAGEH").or_else(|| header.integer("NAXIS2"));
        if let (Some(w), Some(h)) = (width, height) {
            if let (Ok(w), Ok(h)) = (u32::try_from(w), u32::try_from(h)) {
                transform.image_size = Some((w, h));
            }
        }

        Ok(transform)
    }

    /// Parse the primary header of a FITS byte stream.
    pub fn from_fits_bytes(bytes: &[u8]) -> Result<Self, WcsError> {
        if !fits::is_fits(bytes) {
            return Err(FitsError::NotFits("transform file".to_string()).into());
        }
        let (header, _) = Header::parse(bytes)?;
        Self::from_header(&header)
    }

    /// Image dimensions recorded alongside the solution, if any.
    pub fn image_size(&self) -> Option<(u32, u32)> {
        self.image_size
    }

    /// Sky position of the reference pixel.
    pub fn reference_position(&self) -> SkyPosition {
        SkyPosition::new(self.crval[0], self.crval[1])
    }

    /// Approximate plate scale in arcseconds per pixel.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        let det = self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0];
        det.abs().sqrt() * 3600.0
    }

    /// Map a 0-based pixel position to the sky.
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> Result<SkyPosition, WcsError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(WcsError::NonFinite);
        }

        let mut u = x + 1.0 - self.crpix[0];
        let mut v = y + 1.0 - self.crpix[1];
        if let Some(sip) = &self.sip {
            let (du, dv) = (sip.a.eval(u, v), sip.b.eval(u, v));
            u += du;
            v += dv;
        }

        let xi = (self.cd[0][0] * u + self.cd[0][1] * v).to_radians();
        let eta = (self.cd[1][0] * u + self.cd[1][1] * v).to_radians();

        let (ra, dec) = inverse_tan_project(
            xi,
            eta,
            self.crval[0].to_radians(),
            self.crval[1].to_radians(),
        );
        if !ra.is_finite() || !dec.is_finite() {
            return Err(WcsError::NonFinite);
        }
        Ok(SkyPosition::new(ra.to_degrees(), dec.to_degrees()))
    }

    /// Map a sky position to a 0-based pixel position.
    pub fn sky_to_pixel(&self, position: &SkyPosition) -> Result<(f64, f64), WcsError> {
        if !position.ra_deg.is_finite() || !position.dec_deg.is_finite() {
            return Err(WcsError::NonFinite);
        }

        let (xi, eta) = tan_project(
            position.ra_deg.to_radians(),
            position.dec_deg.to_radians(),
            self.crval[0].to_radians(),
            self.crval[1].to_radians(),
        )
        .ok_or(WcsError::BehindTangentPlane)?;

        let (xi, eta) = (xi.to_degrees(), eta.to_degrees());
        let up = self.cd_inv[0][0] * xi + self.cd_inv[0][1] * eta;
        let vp = self.cd_inv[1][0] * xi + self.cd_inv[1][1] * eta;

        let (u, v) = match &self.sip {
            Some(sip) => undistort(sip, up, vp)?,
            None => (up, vp),
        };

        Ok((u + self.crpix[0] - 1.0, v + self.crpix[1] - 1.0))
    }
}

/// Solve `u + A(u, v) = up`, `v + B(u, v) = vp` by fixed-point iteration,
/// seeded from the inverse polynomials when present.
fn undistort(sip: &SipDistortion, up: f64, vp: f64) -> Result<(f64, f64), WcsError> {
    let mut u = up + sip.ap.as_ref().map_or(0.0, |p| p.eval(up, vp));
    let mut v = vp + sip.bp.as_ref().map_or(0.0, |p| p.eval(up, vp));

    for _ in 0..SIP_MAX_ITERATIONS {
        let next_u = up - sip.a.eval(u, v);
        let next_v = vp - sip.b.eval(u, v);
        let delta = (next_u - u).abs().max((next_v - v).abs());
        u = next_u;
        v = next_v;
        if !u.is_finite() || !v.is_finite() {
            return Err(WcsError::NonFinite);
        }
        if delta < SIP_TOLERANCE {
            return Ok((u, v));
        }
    }
    Err(WcsError::NotConverged)
}

fn linear_matrix(header: &Header) -> Result<[[f64; 2]; 2], WcsError> {
    let cd_keys = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"];
    if cd_keys.iter().any(|k| header.contains(k)) {
        let v = |k: &str| header.float(k).unwrap_or(0.0);
        return Ok([[v("CD1_1"), v("CD1_2")], [v("CD2_1"), v("CD2_2")]]);
    }

    let cdelt1 = header.required_float("CDELT1")?;
    let cdelt2 = header.required_float("CDELT2")?;

    if ["PC1_1", "PC1_2", "PC2_1", "PC2_2"]
        .iter()
        .any(|k| header.contains(k))
    {
        let pc = |k: &str, default: f64| header.float(k).unwrap_or(default);
        return Ok([
            [cdelt1 * pc("PC1_1", 1.0), cdelt1 * pc("PC1_2", 0.0)],
            [cdelt2 * pc("PC2_1", 0.0), cdelt2 * pc("PC2_2", 1.0)],
        ]);
    }

    let (sin_r, cos_r) = header.float("CROTA2").unwrap_or(0.0).to_radians().sin_cos();
    Ok([
        [cdelt1 * cos_r, -cdelt2 * sin_r],
        [cdelt1 * sin_r, cdelt2 * cos_r],
    ])
}

/// Gnomonic projection onto the plane tangent at `(crval_ra, crval_dec)`.
/// All angles in radians.
fn tan_project(ra: f64, dec: f64, crval_ra: f64, crval_dec: f64) -> Option<(f64, f64)> {
    let da = ra - crval_ra;
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let cos_da = da.cos();

    let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
    if denom <= 1e-12 {
        return None;
    }

    let xi = cos_dec * da.sin() / denom;
    let eta = (sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom;
    Some((xi, eta))
}

fn inverse_tan_project(xi: f64, eta: f64, crval_ra: f64, crval_dec: f64) -> (f64, f64) {
    let (sin_dec0, cos_dec0) = crval_dec.sin_cos();
    let denom = cos_dec0 - eta * sin_dec0;

    let ra = crval_ra + xi.atan2(denom);
    let dec = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());
    (ra, dec)
}

fn cd_inverse(cd: &[[f64; 2]; 2]) -> Option<[[f64; 2]; 2]> {
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det.abs() < 1e-30 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [cd[1][1] * inv_det, -cd[0][1] * inv_det],
        [-cd[1][0] * inv_det, cd[0][0] * inv_det],
    ])
}
