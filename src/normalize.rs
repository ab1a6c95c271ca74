use image::imageops;
use serde::{Deserialize, Serialize};

use crate::grid::{corner_background, interval_mode, intervals_of};
use crate::image::EcgImage;

// ── Constants ─────────────────────────────────────────────────────────────

/// Horizontal brightness gradient above which a pixel pair is an edge.
const EDGE_GRADIENT: f64 = 50.0;

/// Brightness offset from background that counts as a grid-line deviation
/// in the periodicity voter.
const PERIODICITY_DEVIATION: f64 = 15.0;

/// Combined confidence the inverted voters must reach before pixels are
/// actually flipped.
const INVERSION_CONFIDENCE_BAR: f64 = 0.6;

/// Sampling stride for the whole-image histogram voter.
const HISTOGRAM_STRIDE: u32 = 3;

// ── Types ─────────────────────────────────────────────────────────────────

/// One voter's opinion on whether the display is white-on-black.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InversionVote {
    pub inverted: bool,
    pub confidence: f64,
}

/// Outcome of the inversion decision: the majority verdict plus the three
/// individual votes for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InversionDecision {
    pub inverted: bool,
    pub confidence: f64,
    pub votes: [InversionVote; 3],
}

// ── EXIF orientation ──────────────────────────────────────────────────────

/// Apply the EXIF orientation tag (1–8) as one of the eight dihedral
/// symmetry operations. Values 5–8 swap width and height. Unknown values
/// leave the image untouched. Must run before any detection stage reads
/// pixels.
pub fn apply_exif_orientation(img: EcgImage, orientation: u8) -> EcgImage {
    let rgba = img.into_rgba();
    let out = match orientation {
        2 => imageops::flip_horizontal(&rgba),
        3 => imageops::rotate180(&rgba),
        4 => imageops::flip_vertical(&rgba),
        5 => imageops::flip_horizontal(&imageops::rotate90(&rgba)),
        6 => imageops::rotate90(&rgba),
        7 => imageops::flip_vertical(&imageops::rotate90(&rgba)),
        8 => imageops::rotate270(&rgba),
        _ => rgba,
    };
    EcgImage::from_image(out)
}

// ── Inversion voters ──────────────────────────────────────────────────────

/// Voter (a): dark/light pixel ratio over a strided sample. A mostly-dark
/// page is a device screenshot or an inverted export.
fn histogram_vote(img: &EcgImage) -> InversionVote {
    let mut dark = 0u64;
    let mut total = 0u64;
    let (w, h) = (img.width(), img.height());
    for y in (0..h).step_by(HISTOGRAM_STRIDE as usize) {
        for x in (0..w).step_by(HISTOGRAM_STRIDE as usize) {
            if let Some(c) = img.pixel(x as i32, y as i32) {
                total += 1;
                if c.brightness() < 128.0 {
                    dark += 1;
                }
            }
        }
    }
    if total == 0 {
        return InversionVote { inverted: false, confidence: 0.0 };
    }
    let dark_fraction = dark as f64 / total as f64;
    InversionVote {
        inverted: dark_fraction > 0.5,
        confidence: ((dark_fraction - 0.5).abs() * 2.0).min(1.0),
    }
}

/// Voter (b): on a dark-on-light tracing, edge pixels (ink) are darker than
/// the non-edge mass (paper). When the relationship flips, so is the image.
fn edge_brightness_vote(img: &EcgImage) -> InversionVote {
    let (w, h) = (img.width() as i32, img.height() as i32);
    let mut edge_sum = 0.0;
    let mut edge_n = 0u64;
    let mut other_sum = 0.0;
    let mut other_n = 0u64;

    for y in (0..h).step_by(2) {
        for x in 0..w - 1 {
            let b0 = 255.0 - img.darkness(x, y);
            let b1 = 255.0 - img.darkness(x + 1, y);
            if (b1 - b0).abs() > EDGE_GRADIENT {
                edge_sum += b0 + b1;
                edge_n += 2;
            } else {
                other_sum += b0;
                other_n += 1;
            }
        }
    }
    if edge_n == 0 || other_n == 0 {
        return InversionVote { inverted: false, confidence: 0.0 };
    }
    let edge_mean = edge_sum / edge_n as f64;
    let other_mean = other_sum / other_n as f64;
    InversionVote {
        inverted: edge_mean > other_mean,
        confidence: ((edge_mean - other_mean).abs() / 100.0).min(1.0),
    }
}

/// Voter (c): grid periodicity. Collect positions brighter / darker than
/// the corner background along three scan lines; whichever population shows
/// the more regular spacing is the grid, and bright grid lines mean the
/// page is inverted.
fn periodicity_vote(img: &EcgImage) -> InversionVote {
    let bg = corner_background(img);
    let bg_brightness = bg.brightness();
    let (w, h) = (img.width() as i32, img.height() as i32);

    let mut brighter: Vec<i32> = Vec::new();
    let mut darker: Vec<i32> = Vec::new();
    for &y in &[h / 4, h / 2, 3 * h / 4] {
        let mut last_b = -10i32;
        let mut last_d = -10i32;
        for x in 0..w {
            let Some(c) = img.pixel(x, y) else { continue };
            let delta = c.brightness() - bg_brightness;
            if delta > PERIODICITY_DEVIATION && x - last_b > 1 {
                brighter.push(x);
                last_b = x;
            } else if delta < -PERIODICITY_DEVIATION && x - last_d > 1 {
                darker.push(x);
                last_d = x;
            }
        }
    }

    let regularity = |positions: &[i32]| -> f64 {
        let intervals = intervals_of(positions);
        if intervals.len() < 8 {
            return 0.0;
        }
        match interval_mode(&intervals) {
            Some((mode, _)) => {
                let near = intervals.iter().filter(|&&d| (d - mode).abs() <= 2).count();
                near as f64 / intervals.len() as f64
            }
            None => 0.0,
        }
    };

    let bright_score = regularity(&brighter);
    let dark_score = regularity(&darker);
    InversionVote {
        inverted: bright_score > dark_score && bright_score > 0.3,
        confidence: (bright_score - dark_score).abs().min(1.0),
    }
}

// ── Decision ──────────────────────────────────────────────────────────────

/// Run all three voters and take a majority decision. Inversion requires at
/// least two inverted votes whose mean confidence clears the bar.
pub fn detect_inversion(img: &EcgImage) -> InversionDecision {
    let votes = [histogram_vote(img), edge_brightness_vote(img), periodicity_vote(img)];
    let inverted_votes: Vec<&InversionVote> = votes.iter().filter(|v| v.inverted).collect();

    let combined = if inverted_votes.is_empty() {
        0.0
    } else {
        inverted_votes.iter().map(|v| v.confidence).sum::<f64>() / inverted_votes.len() as f64
    };
    let inverted = inverted_votes.len() >= 2 && combined > INVERSION_CONFIDENCE_BAR;

    tracing::debug!(
        votes = ?votes.iter().map(|v| (v.inverted, v.confidence)).collect::<Vec<_>>(),
        inverted,
        "inversion decision"
    );
    InversionDecision { inverted, confidence: combined, votes }
}

/// Full normalization: EXIF orientation, then color inversion when the
/// voters call for it. Returns the image every downstream stage sees.
pub fn normalize(img: EcgImage, exif_orientation: u8) -> (EcgImage, InversionDecision) {
    let oriented = apply_exif_orientation(img, exif_orientation);
    let decision = detect_inversion(&oriented);
    let out = if decision.inverted { oriented.inverted() } else { oriented };
    (out, decision)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Color;
    use image::{Rgba, RgbaImage};

    /// White page, pink grid every 10 px, one black waveform row band.
    fn tracing_image() -> EcgImage {
        let mut img = RgbaImage::from_pixel(400, 200, Rgba([255, 255, 255, 255]));
        for x in (0..400).step_by(10) {
            for y in 0..200 {
                img.put_pixel(x, y, Rgba([250, 200, 205, 255]));
            }
        }
        for x in 0..400u32 {
            let y = 100 + ((x as f64 / 20.0).sin() * 20.0) as i32;
            img.put_pixel(x, y.clamp(0, 199) as u32, Rgba([10, 10, 10, 255]));
        }
        EcgImage::from_image(img)
    }

    #[test]
    fn normal_tracing_is_not_inverted() {
        let decision = detect_inversion(&tracing_image());
        assert!(!decision.inverted);
    }

    #[test]
    fn inverted_tracing_is_detected_and_corrected() {
        let flipped = tracing_image().inverted();
        let decision = detect_inversion(&flipped);
        assert!(decision.inverted);
        assert!(decision.confidence > 0.6);

        // Round trip: normalize(inverted) should look like the original.
        let (restored, _) = normalize(flipped, 1);
        assert_eq!(restored.pixel(5, 5), Some(Color::WHITE));
    }

    #[test]
    fn exif_rotation_6_swaps_dimensions() {
        let img = crate::image::solid_image(40, 20, Color::WHITE);
        let rotated = apply_exif_orientation(img, 6);
        assert_eq!((rotated.width(), rotated.height()), (20, 40));
    }

    #[test]
    fn exif_rotation_6_maps_top_left_to_top_right() {
        let mut raw = RgbaImage::from_pixel(4, 2, Rgba([255, 255, 255, 255]));
        raw.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        let rotated = apply_exif_orientation(EcgImage::from_image(raw), 6);
        // 90° CW: (0, 0) of a 4×2 image lands at (h-1, 0) = (1, 0).
        assert_eq!(rotated.pixel(1, 0), Some(Color::BLACK));
        assert_eq!(rotated.pixel(0, 0), Some(Color::WHITE));
    }

    #[test]
    fn exif_identity_and_unknown_are_noops() {
        let img = tracing_image();
        let before = img.pixel(13, 7);
        let same = apply_exif_orientation(img, 1);
        assert_eq!(same.pixel(13, 7), before);
        let odd = apply_exif_orientation(same, 99);
        assert_eq!(odd.pixel(13, 7), before);
    }
}
