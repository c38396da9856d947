//! Minimal FITS reader.
//!
//! Covers what the reconciliation engine consumes: header-only files (the
//! calibration service's transform file), primary 2D images, and scalar
//! BINTABLE columns (reference lists).

use std::collections::HashMap;

use thiserror::Error;

pub const BLOCK_SIZE: usize = 2880;
pub const CARD_SIZE: usize = 80;

#[derive(Debug, Error)]
pub enum FitsError {
    #[error("Not a FITS file: {0}")]
    NotFits(String),

    #[error("FITS data truncated: {0}")]
    Truncated(String),

    #[error("Missing FITS keyword: {0}")]
    MissingKeyword(String),

    #[error("Invalid value for {keyword}: {value}")]
    InvalidValue { keyword: String, value: String },

    #[error("Unsupported FITS feature: {0}")]
    Unsupported(String),
}

/// Parsed value of a header card.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Header of a single HDU, keywords in file order.
#[derive(Debug, Clone, Default)]
pub struct Header {
    cards: Vec<(String, HeaderValue)>,
}

impl Header {
    /// Parse a header starting at `bytes[0]`.
    ///
    /// Returns the header and the number of bytes it occupies, padded to the
    /// block size (or to the end of input for unpadded header-only files).
    pub fn parse(bytes: &[u8]) -> Result<(Header, usize), FitsError> {
        let mut cards = Vec::new();
        let mut offset = 0;

        loop {
            if offset >= bytes.len() {
                return Err(FitsError::Truncated("header has no END card".to_string()));
            }
            let end = (offset + CARD_SIZE).min(bytes.len());
            let card = String::from_utf8_lossy(&bytes[offset..end]);
            offset = end;

            let keyword = card.get(..8).unwrap_or(card.as_ref()).trim_end().to_string();
            if keyword == "END" {
                break;
            }
            if keyword.is_empty() || keyword == "COMMENT" || keyword == "HISTORY" {
                continue;
            }
            if card.get(8..10) != Some("= ") {
                continue;
            }
            let value = parse_value(card.get(10..).unwrap_or(""));
            cards.push((keyword, value));
        }

        let padded = offset.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        Ok((Header { cards }, padded.min(bytes.len())))
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderValue> {
        self.cards
            .iter()
            .find(|(k, _)| k == keyword)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, keyword: &str) -> bool {
        self.get(keyword).is_some()
    }

    /// Numeric value, accepting integer cards as floats.
    pub fn float(&self, keyword: &str) -> Option<f64> {
        match self.get(keyword)? {
            HeaderValue::Float(f) => Some(*f),
            HeaderValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn integer(&self, keyword: &str) -> Option<i64> {
        match self.get(keyword)? {
            HeaderValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn text(&self, keyword: &str) -> Option<&str> {
        match self.get(keyword)? {
            HeaderValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn required_float(&self, keyword: &str) -> Result<f64, FitsError> {
        self.float(keyword)
            .ok_or_else(|| FitsError::MissingKeyword(keyword.to_string()))
    }

    pub fn required_integer(&self, keyword: &str) -> Result<i64, FitsError> {
        self.integer(keyword)
            .ok_or_else(|| FitsError::MissingKeyword(keyword.to_string()))
    }

    /// Size of the data unit in bytes, excluding block padding.
    pub fn data_len(&self) -> Result<usize, FitsError> {
        let naxis = self.integer("NAXIS").unwrap_or(0);
        if naxis == 0 {
            return Ok(0);
        }
        let bitpix = self.required_integer("BITPIX")?;
        let mut elements: usize = 1;
        for axis in 1..=naxis {
            let keyword = format!("NAXIS{}", axis);
            let n = self.dimension(&keyword)?;
            elements = elements
                .checked_mul(n)
                .ok_or_else(|| invalid(&keyword, n))?;
        }
        let pcount = self.integer("PCOUNT").unwrap_or(0);
        let gcount = self.integer("GCOUNT").unwrap_or(1);
        let pcount = usize::try_from(pcount).map_err(|_| invalid("PCOUNT", pcount))?;
        let gcount = usize::try_from(gcount).map_err(|_| invalid("GCOUNT", gcount))?;
        let bytes_per = usize::try_from(bitpix.unsigned_abs() / 8)
            .map_err(|_| invalid("BITPIX", bitpix))?;

        elements
            .checked_add(pcount)
            .and_then(|n| n.checked_mul(gcount))
            .and_then(|n| n.checked_mul(bytes_per))
            .ok_or_else(|| invalid("NAXIS", format!("data size overflows ({} axes)", naxis)))
    }

    /// Non-negative integer keyword, such as an axis length.
    pub fn dimension(&self, keyword: &str) -> Result<usize, FitsError> {
        let value = self.required_integer(keyword)?;
        usize::try_from(value).map_err(|_| invalid(keyword, value))
    }
}

fn invalid(keyword: &str, value: impl ToString) -> FitsError {
    FitsError::InvalidValue {
        keyword: keyword.to_string(),
        value: value.to_string(),
    }
}

fn parse_value(raw: &str) -> HeaderValue {
    let raw = raw.trim();

    if let Some(rest) = raw.strip_prefix('\'') {
        // Quotes inside strings are doubled.
        let mut text = String::new();
        let mut chars = rest.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    text.push('\'');
                } else {
                    break;
                }
            } else {
                text.push(c);
            }
        }
        return HeaderValue::Text(text.trim_end().to_string());
    }

    let value = match raw.find('/') {
        Some(idx) => raw[..idx].trim(),
        None => raw,
    };

    match value {
        "T" => return HeaderValue::Logical(true),
        "F" => return HeaderValue::Logical(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return HeaderValue::Integer(i);
    }
    if let Ok(f) = value.replace(['D', 'd'], "E").parse::<f64>() {
        return HeaderValue::Float(f);
    }
    HeaderValue::Text(value.to_string())
}

/// Header data unit.
#[derive(Debug, Clone)]
pub struct Hdu {
    pub header: Header,
    pub data: Vec<u8>,
}

/// Split a FITS byte stream into HDUs.
pub fn read_hdus(bytes: &[u8]) -> Result<Vec<Hdu>, FitsError> {
    if !is_fits(bytes) {
        return Err(FitsError::NotFits("missing SIMPLE card".to_string()));
    }

    let mut hdus = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (header, header_len) = Header::parse(&bytes[offset..])?;
        offset += header_len;

        let data_len = header.data_len()?;
        if offset + data_len > bytes.len() {
            return Err(FitsError::Truncated(format!(
                "HDU {} expects {} data bytes, {} available",
                hdus.len(),
                data_len,
                bytes.len() - offset
            )));
        }
        let data = bytes[offset..offset + data_len].to_vec();
        offset += data_len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        hdus.push(Hdu { header, data });
    }
    Ok(hdus)
}

/// Whether the bytes start with a primary FITS header.
pub fn is_fits(bytes: &[u8]) -> bool {
    bytes.starts_with(b"SIMPLE  =")
}

/// Primary image as row-major f32 samples, first row at `y = 0`.
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<f32>,
}

impl FitsImage {
    /// Decode the primary HDU image. Cubes with a single plane are accepted.
    pub fn from_hdu(hdu: &Hdu) -> Result<Self, FitsError> {
        let header = &hdu.header;
        let naxis = header.required_integer("NAXIS")?;
        if naxis < 2 {
            return Err(FitsError::Unsupported(format!("NAXIS = {}", naxis)));
        }
        for axis in 3..=naxis {
            let n = header.required_integer(&format!("NAXIS{}", axis))?;
            if n != 1 {
                return Err(FitsError::Unsupported(format!("NAXIS{} = {}", axis, n)));
            }
        }

        let width = header.dimension("NAXIS1")?;
        let height = header.dimension("NAXIS2")?;
        let bitpix = header.required_integer("BITPIX")?;
        let bscale = header.float("BSCALE").unwrap_or(1.0);
        let bzero = header.float("BZERO").unwrap_or(0.0);

        let bytes_per = (bitpix.unsigned_abs() / 8) as usize;
        let count = width
            .checked_mul(height)
            .ok_or_else(|| invalid("NAXIS2", format!("{} x {} overflows", width, height)))?;
        let needed = count
            .checked_mul(bytes_per)
            .ok_or_else(|| invalid("BITPIX", bitpix))?;
        if hdu.data.len() < needed {
            return Err(FitsError::Truncated("image data".to_string()));
        }

        let raw: Vec<f64> = match bitpix {
            8 => hdu.data[..count].iter().map(|&b| b as f64).collect(),
            16 => hdu.data[..count * 2]
                .chunks_exact(2)
                .map(|c| i16::from_be_bytes([c[0], c[1]]) as f64)
                .collect(),
            32 => hdu.data[..count * 4]
                .chunks_exact(4)
                .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            -32 => hdu.data[..count * 4]
                .chunks_exact(4)
                .map(|c| f32::from_be_bytes([c[0], c[1], c[2], c[3]]) as f64)
                .collect(),
            -64 => hdu.data[..count * 8]
                .chunks_exact(8)
                .map(|c| {
                    f64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                })
                .collect(),
            other => {
                return Err(FitsError::Unsupported(format!("BITPIX = {}", other)));
            }
        };

        let pixels = raw
            .into_iter()
            .map(|v| (bzero + bscale * v) as f32)
            .collect();
        Ok(Self {
            width,
            height,
            pixels,
        })
    }
}

/// Numeric columns of a BINTABLE extension.
///
/// Only scalar (repeat count 1) numeric columns are decoded; other columns
/// are skipped but still accounted for in the row layout.
#[derive(Debug, Clone, Default)]
pub struct BinTable {
    names: Vec<String>,
    columns: HashMap<String, Vec<f64>>,
    rows: usize,
}

impl BinTable {
    pub fn from_hdu(hdu: &Hdu) -> Result<Self, FitsError> {
        let header = &hdu.header;
        if header.text("XTENSION").map(str::trim) != Some("BINTABLE") {
            return Err(FitsError::Unsupported("HDU is not a BINTABLE".to_string()));
        }

        let row_len = header.dimension("NAXIS1")?;
        let rows = header.dimension("NAXIS2")?;
        let fields = header.dimension("TFIELDS")?;
        let table_len = row_len
            .checked_mul(rows)
            .ok_or_else(|| invalid("NAXIS2", format!("{} x {} overflows", row_len, rows)))?;
        if hdu.data.len() < table_len {
            return Err(FitsError::Truncated("table data".to_string()));
        }

        let mut table = BinTable {
            rows,
            ..Default::default()
        };
        let mut offset: usize = 0;
        for n in 1..=fields {
            let tform_key = format!("TFORM{}", n);
            let tform = header
                .text(&tform_key)
                .ok_or_else(|| FitsError::MissingKeyword(tform_key.clone()))?;
            let (repeat, code) = parse_tform(tform).ok_or_else(|| FitsError::InvalidValue {
                keyword: tform_key.clone(),
                value: tform.to_string(),
            })?;
            let width = element_size(code)
                .ok_or_else(|| FitsError::Unsupported(format!("{} = {}", tform_key, tform)))?
                .checked_mul(repeat)
                .ok_or_else(|| invalid(&tform_key, tform))?;
            // Every column must lie inside the row before any cell is read.
            let end = offset
                .checked_add(width)
                .filter(|&end| end <= row_len)
                .ok_or_else(|| invalid("NAXIS1", format!("{} < {} + {}", row_len, offset, width)))?;

            let name = header
                .text(&format!("TTYPE{}", n))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|| format!("COL{}", n));

            if repeat == 1 && code != 'A' && code != 'L' {
                let scale = header.float(&format!("TSCAL{}", n)).unwrap_or(1.0);
                let zero = header.float(&format!("TZERO{}", n)).unwrap_or(0.0);
                let values = (0..rows)
                    .map(|row| {
                        let start = row * row_len + offset;
                        zero + scale * decode_scalar(code, &hdu.data[start..start + width])
                    })
                    .collect();
                table.columns.insert(name.clone(), values);
            }
            table.names.push(name);
            offset = end;
        }

        Ok(table)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn rows(&self) -> usize {
        self.rows
    }
}

fn parse_tform(tform: &str) -> Option<(usize, char)> {
    let tform = tform.trim();
    let digits: String = tform.chars().take_while(|c| c.is_ascii_digit()).collect();
    let code = tform[digits.len()..].chars().next()?;
    let repeat = if digits.is_empty() {
        1
    } else {
        digits.parse().ok()?
    };
    Some((repeat, code))
}

fn element_size(code: char) -> Option<usize> {
    match code {
        'L' | 'B' | 'A' => Some(1),
        'I' => Some(2),
        'J' | 'E' => Some(4),
        'K' | 'D' => Some(8),
        _ => None,
    }
}

fn decode_scalar(code: char, b: &[u8]) -> f64 {
    match code {
        'B' => b[0] as f64,
        'I' => i16::from_be_bytes([b[0], b[1]]) as f64,
        'J' => i32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        'K' => i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f64,
        'E' => f32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
        'D' => f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]),
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;

    #[test]
    fn test_parse_value_kinds() {
        assert_eq!(parse_value("T"), HeaderValue::Logical(true));
        assert_eq!(parse_value("  42 / answer"), HeaderValue::Integer(42));
        assert_eq!(parse_value("1.5D-3"), HeaderValue::Float(1.5e-3));
        assert_eq!(
            parse_value("'RA---TAN-SIP'  / projection"),
            HeaderValue::Text("RA---TAN-SIP".to_string())
        );
        assert_eq!(
            parse_value("'it''s'"),
            HeaderValue::Text("it's".to_string())
        );
    }

    #[test]
    fn test_header_only_file() {
        let bytes = fixtures::fits_header(&[
            ("SIMPLE", "T"),
            ("BITPIX", "8"),
            ("NAXIS", "0"),
            ("CRVAL1", "83.5"),
            ("CTYPE1", "'RA---TAN'"),
        ]);
        let hdus = read_hdus(&bytes).unwrap();
        assert_eq!(hdus.len(), 1);
        let header = &hdus[0].header;
        assert_eq!(header.float("CRVAL1"), Some(83.5));
        assert_eq!(header.text("CTYPE1"), Some("RA---TAN"));
        assert!(header.contains("NAXIS"));
        assert!(header.get("CRVAL2").is_none());
    }

    #[test]
    fn test_missing_end_card_is_truncated() {
        let bytes = b"SIMPLE  =                    T".to_vec();
        let err = read_hdus(&bytes).unwrap_err();
        assert!(matches!(err, FitsError::Truncated(_)));
    }

    #[test]
    fn test_not_fits() {
        assert!(matches!(
            read_hdus(b"X,Y\n1,2\n").unwrap_err(),
            FitsError::NotFits(_)
        ));
    }

    #[test]
    fn test_bintable_columns() {
        let bytes = fixtures::fits_bintable(&[("RA", &[10.0, 20.0]), ("DEC", &[-1.0, 1.5])]);
        let hdus = read_hdus(&bytes).unwrap();
        assert_eq!(hdus.len(), 2);
        let table = BinTable::from_hdu(&hdus[1]).unwrap();
        assert_eq!(table.rows(), 2);
        assert_eq!(table.column("RA"), Some(&[10.0, 20.0][..]));
        assert_eq!(table.column("DEC"), Some(&[-1.0, 1.5][..]));
        assert_eq!(table.column_names(), &["RA".to_string(), "DEC".to_string()]);
    }

    #[test]
    fn test_primary_image_i16_with_bzero() {
        let bytes = fixtures::fits_image_i16(2, 2, &[0, 1, 2, -3], 100.0);
        let hdus = read_hdus(&bytes).unwrap();
        let image = FitsImage::from_hdu(&hdus[0]).unwrap();
        assert_eq!((image.width, image.height), (2, 2));
        assert_eq!(image.pixels, vec![100.0, 101.0, 102.0, 97.0]);
    }

    /// Rewrite the value of an existing header card in place.
    fn set_card(bytes: &mut [u8], keyword: &str, value: &str) {
        let prefix = format!("{:<8}=", keyword);
        let start = bytes
            .chunks(CARD_SIZE)
            .position(|card| card.starts_with(prefix.as_bytes()))
            .map(|i| i * CARD_SIZE)
            .expect("card present");
        let card = format!("{:<8}= {:>20}", keyword, value);
        let card = format!("{:<width$}", card, width = CARD_SIZE);
        bytes[start..start + CARD_SIZE].copy_from_slice(card.as_bytes());
    }

    #[test]
    fn test_bintable_columns_wider_than_row() {
        let mut bytes = fixtures::fits_bintable(&[("X", &[1.0]), ("Y", &[2.0])]);
        let extension = BLOCK_SIZE;
        set_card(&mut bytes[extension..], "NAXIS1", "8");

        let hdus = read_hdus(&bytes).unwrap();
        let err = BinTable::from_hdu(&hdus[1]).unwrap_err();
        assert!(
            matches!(err, FitsError::InvalidValue { ref keyword, .. } if keyword == "NAXIS1"),
            "unexpected error: {}",
            err
        );
    }

    #[test]
    fn test_oversized_axes_are_rejected() {
        let header = fixtures::fits_header(&[
            ("SIMPLE", "T"),
            ("BITPIX", "-64"),
            ("NAXIS", "2"),
            ("NAXIS1", "9223372036854775807"),
            ("NAXIS2", "9223372036854775807"),
        ]);
        assert!(matches!(
            read_hdus(&header).unwrap_err(),
            FitsError::InvalidValue { .. }
        ));

        let (parsed, _) = Header::parse(&header).unwrap();
        let hdu = Hdu {
            header: parsed,
            data: Vec::new(),
        };
        assert!(matches!(
            FitsImage::from_hdu(&hdu).unwrap_err(),
            FitsError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_negative_axis_is_rejected() {
        let header = fixtures::fits_header(&[
            ("SIMPLE", "T"),
            ("BITPIX", "8"),
            ("NAXIS", "1"),
            ("NAXIS1", "-5"),
        ]);
        assert!(matches!(
            read_hdus(&header).unwrap_err(),
            FitsError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_parse_tform() {
        assert_eq!(parse_tform("1D"), Some((1, 'D')));
        assert_eq!(parse_tform("E"), Some((1, 'E')));
        assert_eq!(parse_tform("20A"), Some((20, 'A')));
        assert_eq!(parse_tform(""), None);
    }
}
