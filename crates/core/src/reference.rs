//! Reference source lists returned by the calibration service.
//!
//! Two encodings are accepted: delimited text with `X`/`Y` header columns,
//! or a FITS binary table. Table columns are resolved in a fixed order:
//! `{x,y}`, `{X,Y}`, `{FIELD_X,FIELD_Y}`, then `{RA,DEC}` (sky coordinates,
//! mapped through the inverse transform).

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::fits::{self, BinTable, FitsError};
use crate::sky::SkyPosition;
use crate::wcs::CoordinateTransform;

#[derive(Debug, Error)]
pub enum ReferenceListError {
    /// No recognised column pair. Fatal for this file only.
    #[error("Unrecognised reference list layout: {0}")]
    DataShape(String),

    #[error("Invalid reference list row {line}: {message}")]
    InvalidRow { line: usize, message: String },

    #[error(transparent)]
    Fits(#[from] FitsError),
}

/// Which columns a reference list was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPair {
    DelimitedXy,
    LowerXy,
    UpperXy,
    FieldXy,
    RaDec,
}

impl ColumnPair {
    /// Binary-table resolution order.
    const TABLE_ORDER: [(ColumnPair, &'static str, &'static str); 4] = [
        (ColumnPair::LowerXy, "x", "y"),
        (ColumnPair::UpperXy, "X", "Y"),
        (ColumnPair::FieldXy, "FIELD_X", "FIELD_Y"),
        (ColumnPair::RaDec, "RA", "DEC"),
    ];
}

/// Reference sources in 0-based pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceList {
    pub points: Vec<[f64; 2]>,
    pub columns: ColumnPair,
    /// Sky rows that could not be projected into the image.
    pub dropped: usize,
}

impl ReferenceList {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Parse a reference list, detecting the encoding from its content.
pub fn parse_reference_list(
    bytes: &[u8],
    transform: &CoordinateTransform,
) -> Result<ReferenceList, ReferenceListError> {
    if fits::is_fits(bytes) {
        parse_fits_table(bytes, transform)
    } else {
        parse_delimited(&String::from_utf8_lossy(bytes))
    }
}

fn parse_fits_table(
    bytes: &[u8],
    transform: &CoordinateTransform,
) -> Result<ReferenceList, ReferenceListError> {
    let hdus = fits::read_hdus(bytes)?;
    let hdu = hdus
        .get(1)
        .ok_or_else(|| ReferenceListError::DataShape("no table extension".to_string()))?;
    let table = BinTable::from_hdu(hdu)?;

    for (pair, x_name, y_name) in ColumnPair::TABLE_ORDER {
        let (Some(xs), Some(ys)) = (table.column(x_name), table.column(y_name)) else {
            continue;
        };
        debug!(columns = ?pair, rows = table.rows(), "Resolved reference list columns");

        if pair == ColumnPair::RaDec {
            return Ok(project_sky_columns(xs, ys, transform));
        }

        // FITS pixel columns are 1-based.
        let points = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| [x - 1.0, y - 1.0])
            .collect();
        return Ok(ReferenceList {
            points,
            columns: pair,
            dropped: 0,
        });
    }

    Err(ReferenceListError::DataShape(format!(
        "no recognised column pair among {:?}",
        table.column_names()
    )))
}

fn project_sky_columns(ras: &[f64], decs: &[f64], transform: &CoordinateTransform) -> ReferenceList {
    let mut points = Vec::with_capacity(ras.len());
    let mut dropped = 0;
    for (&ra, &dec) in ras.iter().zip(decs) {
        match transform.sky_to_pixel(&SkyPosition::new(ra, dec)) {
            Ok((x, y)) => points.push([x, y]),
            Err(e) => {
                debug!(ra, dec, error = %e, "Dropping reference source");
                dropped += 1;
            }
        }
    }
    ReferenceList {
        points,
        columns: ColumnPair::RaDec,
        dropped,
    }
}

fn parse_delimited(text: &str) -> Result<ReferenceList, ReferenceListError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty() && !l.trim_start().starts_with('#'));

    let (_, header) = lines
        .next()
        .ok_or_else(|| ReferenceListError::DataShape("empty file".to_string()))?;
    let delimiter = detect_delimiter(header);
    let names: Vec<String> = split_fields(header, delimiter)
        .map(|s| s.trim_matches('"').to_string())
        .collect();

    let column = |name: &str| names.iter().position(|n| n == name);
    let (Some(x_idx), Some(y_idx)) = (column("X"), column("Y")) else {
        return Err(ReferenceListError::DataShape(format!(
            "no X/Y columns in header {:?}",
            names
        )));
    };

    let mut points = Vec::new();
    for (line_no, line) in lines {
        let fields: Vec<&str> = split_fields(line, delimiter).collect();
        let field = |idx: usize| -> Result<f64, ReferenceListError> {
            let raw = fields.get(idx).ok_or_else(|| ReferenceListError::InvalidRow {
                line: line_no + 1,
                message: format!("missing column {}", idx),
            })?;
            raw.trim_matches('"')
                .parse::<f64>()
                .map_err(|e| ReferenceListError::InvalidRow {
                    line: line_no + 1,
                    message: format!("{:?}: {}", raw, e),
                })
        };
        points.push([field(x_idx)?, field(y_idx)?]);
    }

    Ok(ReferenceList {
        points,
        columns: ColumnPair::DelimitedXy,
        dropped: 0,
    })
}

fn detect_delimiter(header: &str) -> Option<char> {
    [',', '\t', ';'].into_iter().find(|d| header.contains(*d))
}

fn split_fields(line: &str, delimiter: Option<char>) -> Box<dyn Iterator<Item = &str> + '_> {
    match delimiter {
        Some(d) => Box::new(line.split(d).map(str::trim)),
        None => Box::new(line.split_whitespace()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    fn transform() -> CoordinateTransform {
        fixtures::tan_transform(150.0, 2.0, 1.0)
    }

    #[test]
    fn test_csv_with_xy_header() {
        let csv = "id,X,Y,flux\n1,10.5,20.25,100\n2,30,40,50\n";
        let list = parse_reference_list(csv.as_bytes(), &transform()).unwrap();
        assert_eq!(list.columns, ColumnPair::DelimitedXy);
        assert_eq!(list.points, vec![[10.5, 20.25], [30.0, 40.0]]);
    }

    #[test]
    fn test_whitespace_delimited_with_comments() {
        let text = "# reference stars\nX Y\n1 2\n\n3 4\n";
        let list = parse_reference_list(text.as_bytes(), &transform()).unwrap();
        assert_eq!(list.points, vec![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_csv_without_xy_is_data_shape_error() {
        let csv = "ra,dec\n1,2\n";
        let err = parse_reference_list(csv.as_bytes(), &transform()).unwrap_err();
        assert!(matches!(err, ReferenceListError::DataShape(_)));
    }

    #[test]
    fn test_csv_bad_row() {
        let csv = "X,Y\n1,abc\n";
        let err = parse_reference_list(csv.as_bytes(), &transform()).unwrap_err();
        assert!(matches!(err, ReferenceListError::InvalidRow { line: 2, .. }));
    }

    #[test]
    fn test_fits_lowercase_preferred_over_field_columns() {
        let bytes = fixtures::fits_bintable(&[
            ("FIELD_X", &[100.0]),
            ("FIELD_Y", &[100.0]),
            ("x", &[11.0]),
            ("y", &[21.0]),
        ]);
        let list = parse_reference_list(&bytes, &transform()).unwrap();
        assert_eq!(list.columns, ColumnPair::LowerXy);
        assert_eq!(list.points, vec![[10.0, 20.0]]);
    }

    #[test]
    fn test_fits_field_columns() {
        let bytes = fixtures::fits_bintable(&[("FIELD_X", &[5.0, 6.0]), ("FIELD_Y", &[7.0, 8.0])]);
        let list = parse_reference_list(&bytes, &transform()).unwrap();
        assert_eq!(list.columns, ColumnPair::FieldXy);
        assert_eq!(list.points, vec![[4.0, 6.0], [5.0, 7.0]]);
    }

    #[test]
    fn test_fits_sky_columns_use_inverse_transform() {
        let t = transform();
        let sky = t.pixel_to_sky(12.0, 34.0).unwrap();
        let bytes = fixtures::fits_bintable(&[("RA", &[sky.ra_deg]), ("DEC", &[sky.dec_deg])]);
        let list = parse_reference_list(&bytes, &t).unwrap();
        assert_eq!(list.columns, ColumnPair::RaDec);
        assert!((list.points[0][0] - 12.0).abs() < 1e-6);
        assert!((list.points[0][1] - 34.0).abs() < 1e-6);
    }

    #[test]
    fn test_fits_unknown_columns() {
        let bytes = fixtures::fits_bintable(&[("MAG", &[12.0])]);
        let err = parse_reference_list(&bytes, &transform()).unwrap_err();
        assert!(matches!(err, ReferenceListError::DataShape(_)));
    }
}
