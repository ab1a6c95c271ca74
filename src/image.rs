use base64::Engine;
use image::{codecs::png::PngEncoder, ImageEncoder, Rgba, RgbaImage};

use crate::error::DigitizeError;
use crate::geom::Color;

/// Largest color-match distance in RGB space (≈ √3·255²), used to fold a
/// color distance into the same 0–255 scale as darkness.
const MAX_COLOR_DISTANCE: f64 = 441.0;

/// Immutable RGBA pixel buffer with the scalar queries every detection stage
/// is written against. Coordinates are top-left-origin pixel indices; all
/// queries are total — out-of-bounds reads answer "nothing there" (0.0)
/// rather than panicking, so scan loops never need explicit edge guards.
#[derive(Debug, Clone)]
pub struct EcgImage {
    inner: RgbaImage,
}

impl EcgImage {
    /// Wrap a row-major RGBA8 buffer. Fails when the byte count does not
    /// match `width × height × 4`.
    pub fn from_rgba8(width: u32, height: u32, data: Vec<u8>) -> Result<Self, DigitizeError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(DigitizeError::InvalidBuffer { expected, actual: data.len() });
        }
        let inner = RgbaImage::from_raw(width, height, data)
            .ok_or(DigitizeError::InvalidBuffer { expected, actual: 0 })?;
        Ok(EcgImage { inner })
    }

    pub fn from_image(inner: RgbaImage) -> Self {
        EcgImage { inner }
    }

    pub fn width(&self) -> u32 {
        self.inner.width()
    }

    pub fn height(&self) -> u32 {
        self.inner.height()
    }

    pub fn as_rgba(&self) -> &RgbaImage {
        &self.inner
    }

    pub fn into_rgba(self) -> RgbaImage {
        self.inner
    }

    /// RGB color at (x, y), or `None` out of bounds.
    pub fn pixel(&self, x: i32, y: i32) -> Option<Color> {
        if x < 0 || y < 0 || x as u32 >= self.inner.width() || y as u32 >= self.inner.height() {
            return None;
        }
        let Rgba([r, g, b, _]) = *self.inner.get_pixel(x as u32, y as u32);
        Some(Color::new(r, g, b))
    }

    /// 255 − mean(r, g, b); 0.0 out of bounds.
    pub fn darkness(&self, x: i32, y: i32) -> f64 {
        self.pixel(x, y).map_or(0.0, |c| c.darkness())
    }

    /// Sub-pixel darkness query: real coordinates are floored.
    pub fn darkness_at(&self, x: f64, y: f64) -> f64 {
        self.darkness(x.floor() as i32, y.floor() as i32)
    }

    /// How strongly the pixel matches `target`, on the darkness scale:
    /// 255 − min(441, euclidean_distance × 0.6). A perfect match scores 255,
    /// so waveforms drawn in red or blue ink can be tested against the same
    /// threshold as black ones.
    pub fn color_match(&self, x: i32, y: i32, target: Color) -> f64 {
        match self.pixel(x, y) {
            Some(c) => 255.0 - (c.distance(target) * 0.6).min(MAX_COLOR_DISTANCE),
            None => 0.0,
        }
    }

    /// Channel-inverted copy: (r, g, b) → (255−r, 255−g, 255−b), alpha kept.
    pub fn inverted(&self) -> EcgImage {
        let mut out = self.inner.clone();
        for p in out.pixels_mut() {
            p[0] = 255 - p[0];
            p[1] = 255 - p[1];
            p[2] = 255 - p[2];
        }
        EcgImage { inner: out }
    }

    /// Lossless PNG, base64-encoded — the payload format the oracle expects.
    pub fn encode_png_base64(&self) -> String {
        let mut png: Vec<u8> = Vec::new();
        if PngEncoder::new(&mut png)
            .write_image(
                self.inner.as_raw(),
                self.inner.width(),
                self.inner.height(),
                image::ExtendedColorType::Rgba8,
            )
            .is_ok()
        {
            base64::engine::general_purpose::STANDARD.encode(&png)
        } else {
            String::new()
        }
    }
}

// ── Test support ──────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn solid_image(width: u32, height: u32, color: Color) -> EcgImage {
    let img = RgbaImage::from_pixel(width, height, Rgba([color.r, color.g, color.b, 255]));
    EcgImage::from_image(img)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_length_is_validated() {
        assert!(EcgImage::from_rgba8(4, 4, vec![0u8; 64]).is_ok());
        assert!(EcgImage::from_rgba8(4, 4, vec![0u8; 63]).is_err());
    }

    #[test]
    fn darkness_is_zero_out_of_bounds() {
        let img = solid_image(8, 8, Color::BLACK);
        assert_eq!(img.darkness(3, 3), 255.0);
        assert_eq!(img.darkness(-1, 3), 0.0);
        assert_eq!(img.darkness(3, 8), 0.0);
    }

    #[test]
    fn subpixel_queries_floor() {
        let mut raw = RgbaImage::from_pixel(2, 1, Rgba([255, 255, 255, 255]));
        raw.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let img = EcgImage::from_image(raw);
        assert_eq!(img.darkness_at(0.99, 0.5), 0.0);
        assert_eq!(img.darkness_at(1.01, 0.5), 255.0);
    }

    #[test]
    fn color_match_peaks_at_exact_color() {
        let red = Color::new(220, 40, 40);
        let img = solid_image(2, 2, red);
        assert_eq!(img.color_match(0, 0, red), 255.0);
        assert!(img.color_match(0, 0, Color::new(40, 220, 40)) < 150.0);
    }

    #[test]
    fn inversion_flips_channels_and_keeps_alpha() {
        let img = solid_image(2, 2, Color::new(10, 20, 30));
        let inv = img.inverted();
        assert_eq!(inv.pixel(0, 0), Some(Color::new(245, 235, 225)));
        assert_eq!(inv.as_rgba().get_pixel(0, 0)[3], 255);
    }
}
