//! Testing utilities and mock implementations.
//!
//! This module provides a test double for each capability trait, allowing
//! the orchestrator and pipeline to be exercised without network access.
//!
//! # Example
//!
//! ```rust,ignore
//! use skyrecon_core::testing::{fixtures, MockCatalogBackend, MockPlateSolver, MockSourceExtractor};
//!
//! let solver = MockPlateSolver::new();
//! let extractor = MockSourceExtractor::new(fixtures::detection_report(vec![
//!     fixtures::detection(10.0, 10.0, 100.0),
//! ]));
//! let gaia = MockCatalogBackend::new(CatalogTag::GaiaDr3);
//!
//! // Configure mock responses
//! solver.set_solution(fixtures::solution(vec![[10.0, 10.0]])).await;
//! gaia.set_always_fail("service unavailable").await;
//! ```

mod mock_catalog_backend;
mod mock_plate_solver;
mod mock_source_extractor;

pub use mock_catalog_backend::MockCatalogBackend;
pub use mock_plate_solver::MockPlateSolver;
pub use mock_source_extractor::MockSourceExtractor;

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::io::Cursor;

    use serde_json::json;

    use crate::calibration::CalibrationSolution;
    use crate::catalog::{CatalogEntry, CatalogTag};
    use crate::detection::{DetectedSource, DetectionReport, Raster, SourceFlags};
    use crate::input::SourceImage;
    use crate::sky::SkyPosition;
    use crate::wcs::CoordinateTransform;

    const CARD: usize = 80;
    const BLOCK: usize = 2880;

    /// Gaussian sigma of synthetic stars, in pixels.
    pub const STAR_SIGMA: f64 = 1.5;

    /// A clean, round detection that passes the default quality filter.
    pub fn detection(x: f64, y: f64, flux: f64) -> DetectedSource {
        DetectedSource {
            x,
            y,
            flux,
            a: 2.0,
            b: 1.8,
            theta: 0.0,
            npix: 25,
            flags: SourceFlags::NONE,
        }
    }

    /// A 100x100 detection report with no flux floor applied.
    pub fn detection_report(sources: Vec<DetectedSource>) -> DetectionReport {
        DetectionReport {
            width: 100,
            height: 100,
            pre_filter_count: sources.len(),
            post_filter_count: sources.len(),
            border_rejected: 0,
            background_rms: 1.0,
            flux_floor: None,
            sources,
        }
    }

    /// TAN transform for a 100x100 image centered on `(ra, dec)`, north up,
    /// east left, `scale` arcseconds per pixel. No image size is recorded.
    pub fn tan_transform(ra: f64, dec: f64, scale: f64) -> CoordinateTransform {
        let s = scale / 3600.0;
        CoordinateTransform::tan([50.5, 50.5], [ra, dec], [[-s, 0.0], [0.0, s]])
            .expect("diagonal CD matrix is invertible")
    }

    /// Calibration at (150, 2), 1"/px, with the given 0-based reference sources.
    pub fn solution(reference_sources: Vec<[f64; 2]>) -> CalibrationSolution {
        CalibrationSolution {
            transform: tan_transform(150.0, 2.0, 1.0),
            reference_sources,
            submission_id: 1,
            job_id: 1,
            reference_degraded: false,
        }
    }

    pub fn catalog_entry(tag: CatalogTag, ra: f64, dec: f64) -> CatalogEntry {
        CatalogEntry::new(
            tag,
            SkyPosition::new(ra, dec),
            json!({ "name": format!("{} {:.5} {:+.5}", tag, ra, dec) }),
        )
    }

    fn card(keyword: &str, value: &str) -> String {
        let mut card = format!("{:<8}= {:>20}", keyword, value);
        card.truncate(CARD);
        format!("{:<width$}", card, width = CARD)
    }

    fn pad_block(bytes: &mut Vec<u8>, fill: u8) {
        let padded = bytes.len().div_ceil(BLOCK) * BLOCK;
        bytes.resize(padded, fill);
    }

    fn header_block(cards: &[(&str, String)]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for (keyword, value) in cards {
            bytes.extend_from_slice(card(keyword, value).as_bytes());
        }
        bytes.extend_from_slice(format!("{:<width$}", "END", width = CARD).as_bytes());
        pad_block(&mut bytes, b' ');
        bytes
    }

    /// A header-only FITS file. Values are written verbatim, so strings
    /// need their quotes: `("CTYPE1", "'RA---TAN'")`.
    pub fn fits_header(cards: &[(&str, &str)]) -> Vec<u8> {
        let cards: Vec<(&str, String)> = cards
            .iter()
            .map(|(k, v)| (*k, v.to_string()))
            .collect();
        header_block(&cards)
    }

    /// Primary header carrying a TAN solution as the plate solver writes it.
    pub fn wcs_header_bytes(ra: f64, dec: f64, scale: f64, width: u32, height: u32) -> Vec<u8> {
        let s = scale / 3600.0;
        let crpix1 = (width as f64 + 1.0) / 2.0;
        let crpix2 = (height as f64 + 1.0) / 2.0;
        header_block(&[
            ("SIMPLE", "T".to_string()),
            ("BITPIX", "8".to_string()),
            ("NAXIS", "0".to_string()),
            ("CTYPE1", "'RA---TAN'".to_string()),
            ("CTYPE2", "'DEC--TAN'".to_string()),
            ("CRPIX1", format!("{:?}", crpix1)),
            ("CRPIX2", format!("{:?}", crpix2)),
            ("CRVAL1", format!("{:?}", ra)),
            ("CRVAL2", format!("{:?}", dec)),
            ("CD1_1", format!("{:?}", -s)),
            ("CD1_2", "0.0".to_string()),
            ("CD2_1", "0.0".to_string()),
            ("CD2_2", format!("{:?}", s)),
            ("IMAGEW", width.to_string()),
            ("IMAGEH", height.to_string()),
        ])
    }

    /// Primary 16-bit image with the given `BZERO`.
    pub fn fits_image_i16(width: usize, height: usize, pixels: &[i16], bzero: f64) -> Vec<u8> {
        let mut bytes = header_block(&[
            ("SIMPLE", "T".to_string()),
            ("BITPIX", "16".to_string()),
            ("NAXIS", "2".to_string()),
            ("NAXIS1", width.to_string()),
            ("NAXIS2", height.to_string()),
            ("BZERO", format!("{:?}", bzero)),
        ]);
        for p in pixels {
            bytes.extend_from_slice(&p.to_be_bytes());
        }
        pad_block(&mut bytes, 0);
        bytes
    }

    /// Empty primary HDU followed by a BINTABLE of `1D` columns.
    ///
    /// All columns must have the same length.
    pub fn fits_bintable(columns: &[(&str, &[f64])]) -> Vec<u8> {
        let rows = columns.first().map(|(_, v)| v.len()).unwrap_or(0);

        let mut bytes = header_block(&[
            ("SIMPLE", "T".to_string()),
            ("BITPIX", "8".to_string()),
            ("NAXIS", "0".to_string()),
            ("EXTEND", "T".to_string()),
        ]);

        let keys: Vec<(String, String)> = (1..=columns.len())
            .map(|n| (format!("TTYPE{}", n), format!("TFORM{}", n)))
            .collect();
        let mut cards = vec![
            ("XTENSION", "'BINTABLE'".to_string()),
            ("BITPIX", "8".to_string()),
            ("NAXIS", "2".to_string()),
            ("NAXIS1", (columns.len() * 8).to_string()),
            ("NAXIS2", rows.to_string()),
            ("PCOUNT", "0".to_string()),
            ("GCOUNT", "1".to_string()),
            ("TFIELDS", columns.len().to_string()),
        ];
        for ((ttype, tform), (name, _)) in keys.iter().zip(columns) {
            cards.push((ttype.as_str(), format!("'{}'", name)));
            cards.push((tform.as_str(), "'1D'".to_string()));
        }
        bytes.extend(header_block(&cards));

        let mut data = Vec::with_capacity(rows * columns.len() * 8);
        for row in 0..rows {
            for (_, values) in columns {
                data.extend_from_slice(&values[row].to_be_bytes());
            }
        }
        pad_block(&mut data, 0);
        bytes.extend(data);
        bytes
    }

    /// Deterministic noise in `[-1, 1]`.
    fn noise_at(x: usize, y: usize) -> f64 {
        let mut z = (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (y as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
        z ^= z >> 31;
        z = z.wrapping_mul(0xBF58_4769_1CE4_E5B9);
        z ^= z >> 29;
        (z % 2001) as f64 / 1000.0 - 1.0
    }

    fn field_value(x: usize, y: usize, stars: &[(f64, f64, f64)], background: f64, noise: f64) -> f64 {
        let mut value = background + noise * noise_at(x, y);
        for &(sx, sy, peak) in stars {
            let dx = x as f64 - sx;
            let dy = y as f64 - sy;
            value += peak * (-(dx * dx + dy * dy) / (2.0 * STAR_SIGMA * STAR_SIGMA)).exp();
        }
        value
    }

    /// Gaussian stars `(x, y, peak)` on a flat background with
    /// deterministic noise of the given amplitude.
    pub fn star_field(
        width: usize,
        height: usize,
        stars: &[(f64, f64, f64)],
        background: f64,
        noise: f64,
    ) -> Raster {
        Raster::from_fn(width, height, |x, y| {
            field_value(x, y, stars, background, noise) as f32
        })
    }

    /// 8-bit grayscale PNG of a star field with light noise.
    pub fn png_image(
        name: &str,
        width: u32,
        height: u32,
        stars: &[(f64, f64, f64)],
        background: f64,
    ) -> SourceImage {
        let img = image::GrayImage::from_fn(width, height, |x, y| {
            let value = field_value(x as usize, y as usize, stars, background, 2.0);
            image::Luma([value.round().clamp(0.0, 255.0) as u8])
        });
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .expect("PNG encoding to memory");
        SourceImage::from_bytes(name, bytes)
    }
}
