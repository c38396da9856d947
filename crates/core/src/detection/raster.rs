//! Grayscale raster decoding.

use image::DynamicImage;

use super::DetectionError;
use crate::fits::{self, FitsImage};

/// Single-channel f32 image, row-major, first row at `y = 0`.
#[derive(Debug, Clone)]
pub struct Raster {
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

impl Raster {
    pub fn new(width: usize, height: usize, pixels: Vec<f32>) -> Result<Self, DetectionError> {
        if width == 0 || height == 0 {
            return Err(DetectionError::InvalidImage("empty image".to_string()));
        }
        if pixels.len() != width * height {
            return Err(DetectionError::InvalidImage(format!(
                "{} pixels for a {}x{} image",
                pixels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Build a raster by evaluating `f(x, y)` for every pixel.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> Self {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Decode FITS (primary HDU) or any raster format the `image` crate reads.
    pub fn decode(bytes: &[u8]) -> Result<Self, DetectionError> {
        if fits::is_fits(bytes) {
            let hdus = fits::read_hdus(bytes)?;
            let primary = hdus
                .first()
                .ok_or_else(|| DetectionError::InvalidImage("no primary HDU".to_string()))?;
            let image = FitsImage::from_hdu(primary)?;
            return Self::new(image.width, image.height, image.pixels);
        }

        let img = image::load_from_memory(bytes)
            .map_err(|e| DetectionError::Decode(e.to_string()))?;
        Self::new(
            img.width() as usize,
            img.height() as usize,
            to_grayscale_f32(&img),
        )
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.pixels[y * self.width + x]
    }
}

/// Luminance in native sample units (0-255 for 8-bit, 0-65535 for 16-bit).
fn to_grayscale_f32(img: &DynamicImage) -> Vec<f32> {
    let luma = |r: f32, g: f32, b: f32| 0.2126 * r + 0.7152 * g + 0.0722 * b;
    match img {
        DynamicImage::ImageLuma16(g) => g.as_raw().iter().map(|&v| v as f32).collect(),
        DynamicImage::ImageLumaA16(g) => g.pixels().map(|p| p.0[0] as f32).collect(),
        DynamicImage::ImageRgb16(rgb) => rgb
            .pixels()
            .map(|p| luma(p.0[0] as f32, p.0[1] as f32, p.0[2] as f32))
            .collect(),
        DynamicImage::ImageRgba16(rgba) => rgba
            .pixels()
            .map(|p| luma(p.0[0] as f32, p.0[1] as f32, p.0[2] as f32))
            .collect(),
        DynamicImage::ImageRgb32F(rgb) => rgb.pixels().map(|p| luma(p.0[0], p.0[1], p.0[2])).collect(),
        DynamicImage::ImageRgba32F(rgba) => {
            rgba.pixels().map(|p| luma(p.0[0], p.0[1], p.0[2])).collect()
        }
        _ => img.to_luma8().as_raw().iter().map(|&v| v as f32).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures;
    use image::{GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    #[test]
    fn test_new_rejects_mismatched_len() {
        assert!(matches!(
            Raster::new(2, 2, vec![0.0; 3]),
            Err(DetectionError::InvalidImage(_))
        ));
        assert!(Raster::new(0, 0, vec![]).is_err());
    }

    #[test]
    fn test_decode_png() {
        let img = GrayImage::from_fn(4, 3, |x, y| Luma([(x + 10 * y) as u8]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();

        let raster = Raster::decode(buf.get_ref()).unwrap();
        assert_eq!((raster.width(), raster.height()), (4, 3));
        assert_eq!(raster.get(3, 2), 23.0);
    }

    #[test]
    fn test_decode_fits() {
        let bytes = fixtures::fits_image_i16(3, 2, &[1, 2, 3, 4, 5, 6], 0.0);
        let raster = Raster::decode(&bytes).unwrap();
        assert_eq!((raster.width(), raster.height()), (3, 2));
        assert_eq!(raster.get(0, 1), 4.0);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Raster::decode(b"definitely not an image"),
            Err(DetectionError::Decode(_))
        ));
    }
}
