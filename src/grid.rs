use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geom::Color;
use crate::image::EcgImage;

// ── Constants ─────────────────────────────────────────────────────────────

/// Interval histogram range (px). Spacings outside this cannot be a
/// plausible small-box width at any realistic scan resolution.
const MIN_INTERVAL_PX: i32 = 3;
const MAX_INTERVAL_PX: i32 = 100;

/// Plausible px-per-mm for real scans; outside this the detection is noise.
const MIN_PX_PER_MM: f64 = 2.0;
const MAX_PX_PER_MM: f64 = 30.0;

/// Fewer observed intervals than this → detection is refused outright.
const MIN_INTERVALS: usize = 15;

/// Pixels darker than this brightness are waveform ink, never grid.
const WAVEFORM_BRIGHTNESS_CUTOFF: f64 = 60.0;

/// Per-channel L1 distance below which a pixel is background, not a line.
const BACKGROUND_L1_CUTOFF: u32 = 20;

/// Side length of the corner patches sampled for the background color.
const CORNER_PATCH: u32 = 20;

// ── GridInfo ──────────────────────────────────────────────────────────────

/// Result of grid geometry discovery. `px_per_mm` is meaningful only when
/// `detected` holds; downstream consumers fall back to panel-width or
/// page-width estimates otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridInfo {
    pub detected: bool,
    pub px_per_mm: f64,
    pub small_box_px: f64,
    pub large_box_px: f64,
    pub thin_line_color: Option<Color>,
    pub thick_line_color: Option<Color>,
    pub background: Color,
    pub rotation_rad: f64,
    pub confidence: f64,
}

impl GridInfo {
    pub fn undetected(background: Color) -> Self {
        GridInfo {
            detected: false,
            px_per_mm: 0.0,
            small_box_px: 0.0,
            large_box_px: 0.0,
            thin_line_color: None,
            thick_line_color: None,
            background,
            rotation_rad: 0.0,
            confidence: 0.0,
        }
    }
}

// ── Background sampling ───────────────────────────────────────────────────

/// Background paper color sampled from four corner patches. On a dense
/// grid the line color can outnumber the paper between lines, so among the
/// well-represented corner colors the lightest one is the paper.
pub(crate) fn corner_background(img: &EcgImage) -> Color {
    let w = img.width();
    let h = img.height();
    let patch = CORNER_PATCH.min(w).min(h);
    if patch == 0 {
        return Color::WHITE;
    }

    let mut counts: HashMap<Color, u32> = HashMap::new();
    let corners = [
        (0, 0),
        (w - patch, 0),
        (0, h - patch),
        (w - patch, h - patch),
    ];
    for (cx, cy) in corners {
        for y in cy..cy + patch {
            for x in cx..cx + patch {
                if let Some(c) = img.pixel(x as i32, y as i32) {
                    *counts.entry(c).or_insert(0) += 1;
                }
            }
        }
    }
    let Some(max_count) = counts.values().copied().max() else {
        return Color::WHITE;
    };
    counts
        .into_iter()
        .filter(|&(_, n)| n * 4 >= max_count)
        .max_by(|a, b| {
            a.0.brightness()
                .partial_cmp(&b.0.brightness())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        })
        .map(|(c, _)| c)
        .unwrap_or(Color::WHITE)
}

// ── Grid-line predicate ───────────────────────────────────────────────────

/// Whether a pixel plausibly sits on a printed grid line, judged against
/// the sampled background color.
pub(crate) fn is_grid_line(c: Color, bg: Color) -> bool {
    // Very dark pixels are waveform ink.
    if c.brightness() < WAVEFORM_BRIGHTNESS_CUTOFF {
        return false;
    }
    // Near-background pixels are paper.
    if c.l1_distance(bg) < BACKGROUND_L1_CUTOFF {
        return false;
    }

    let (r, g, b) = (c.r as f64, c.g as f64, c.b as f64);

    // Chromatic lines: one channel dominates by the configured ratios.
    let pink = r > 150.0 && r > 1.05 * g && r > 1.05 * b;
    let blue = b > 100.0 && b > 1.05 * r && b > 1.05 * g;
    let green = g > 100.0 && g > 1.05 * r && g > 1.05 * b;
    let orange = r > 150.0 && g > 100.0 && b < 100.0 && r > 1.05 * b && g > 1.05 * b;
    if pink || blue || green || orange {
        return true;
    }

    // Low-saturation (gray) lines in a plausible mid-gray band.
    let brightness = c.brightness();
    c.saturation() < 0.15
        && (brightness - bg.brightness()).abs() > 15.0
        && (60.0..240.0).contains(&brightness)
}

// ── Interval analysis ─────────────────────────────────────────────────────

/// Consecutive differences of a monotone position list, kept to the
/// plausible small-box range.
pub(crate) fn intervals_of(positions: &[i32]) -> Vec<i32> {
    positions
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|&d| (MIN_INTERVAL_PX..=MAX_INTERVAL_PX).contains(&d))
        .collect()
}

/// Histogram mode of an interval list: (interval, count).
pub(crate) fn interval_mode(intervals: &[i32]) -> Option<(i32, usize)> {
    let mut hist = [0usize; (MAX_INTERVAL_PX + 1) as usize];
    for &d in intervals {
        hist[d as usize] += 1;
    }
    hist.iter()
        .enumerate()
        .skip(MIN_INTERVAL_PX as usize)
        .max_by_key(|&(_, &n)| n)
        .filter(|&(_, &n)| n > 0)
        .map(|(i, &n)| (i as i32, n))
}

// ── Detection ─────────────────────────────────────────────────────────────

/// Infer grid geometry from periodic line spacing along three horizontal
/// scan lines at 25%, 50%, 75% of image height.
pub fn detect_grid(img: &EcgImage) -> GridInfo {
    let bg = corner_background(img);
    let w = img.width() as i32;
    let h = img.height() as i32;
    if w < MIN_INTERVAL_PX * 2 || h < 4 {
        return GridInfo::undetected(bg);
    }

    let scan_rows = [h / 4, h / 2, 3 * h / 4];
    let mut all_intervals: Vec<i32> = Vec::new();
    let mut line_colors: Vec<Color> = Vec::new();

    for &base_y in &scan_rows {
        // A row that is itself a horizontal grid line is wall-to-wall line
        // color and carries no spacing information; slide down until the
        // row is mostly background.
        let mut y = base_y;
        for _ in 0..3 {
            let hits = (0..w)
                .filter(|&x| img.pixel(x, y).is_some_and(|c| is_grid_line(c, bg)))
                .count();
            if (hits as f64) < 0.5 * w as f64 {
                break;
            }
            y = (y + 1).min(h - 1);
        }

        let mut positions: Vec<i32> = Vec::new();
        for x in 0..w {
            if let Some(c) = img.pixel(x, y) {
                if is_grid_line(c, bg) {
                    positions.push(x);
                    line_colors.push(c);
                }
            }
        }
        // Collapse runs of adjacent hits (a line several px wide) into one
        // position at the run start, so intervals measure line spacing.
        let mut collapsed: Vec<i32> = Vec::new();
        for &p in &positions {
            if collapsed.last().map_or(true, |&q| p - q > 1) {
                collapsed.push(p);
            }
        }
        all_intervals.extend(intervals_of(&collapsed));
    }

    if all_intervals.len() < MIN_INTERVALS {
        let mut info = GridInfo::undetected(bg);
        info.confidence = 0.3 * all_intervals.len() as f64 / MIN_INTERVALS as f64;
        return info;
    }

    let Some((small_px, _)) = interval_mode(&all_intervals) else {
        return GridInfo::undetected(bg);
    };

    // Large box: strongest interval within ±3 px of 5× the small box,
    // accepted with at least 3 observations.
    let target_large = small_px * 5;
    let mut large_px = target_large;
    let mut best_large_count = 0usize;
    for cand in (target_large - 3)..=(target_large + 3) {
        let count = all_intervals.iter().filter(|&&d| d == cand).count();
        if count > best_large_count {
            best_large_count = count;
            large_px = cand;
        }
    }
    if best_large_count < 3 {
        large_px = target_large;
    }

    let matched = all_intervals
        .iter()
        .filter(|&&d| (d - small_px).abs() <= 2 || (d - large_px).abs() <= 3)
        .count();
    let confidence = (matched as f64 / all_intervals.len() as f64).min(0.9);

    let px_per_mm = small_px as f64;
    let plausible = (MIN_PX_PER_MM..=MAX_PX_PER_MM).contains(&px_per_mm);
    let (thin, thick) = classify_line_colors(&line_colors);

    GridInfo {
        detected: plausible,
        px_per_mm,
        small_box_px: small_px as f64,
        large_box_px: large_px as f64,
        thin_line_color: thin,
        thick_line_color: thick,
        background: bg,
        rotation_rad: 0.0,
        confidence: if plausible { confidence } else { confidence * 0.5 },
    }
}

/// Split observed line-pixel colors into thin (modal) and thick (darker
/// modal) populations. Thick large-box lines print darker than thin ones;
/// when no darker population exists both report the same color.
fn classify_line_colors(colors: &[Color]) -> (Option<Color>, Option<Color>) {
    if colors.is_empty() {
        return (None, None);
    }
    let mut counts: HashMap<Color, u32> = HashMap::new();
    for &c in colors {
        *counts.entry(c).or_insert(0) += 1;
    }
    let thin = counts
        .iter()
        .max_by_key(|&(_, &n)| n)
        .map(|(&c, _)| c)
        .unwrap_or(Color::WHITE);

    let thick = counts
        .iter()
        .filter(|(c, _)| c.darkness() > thin.darkness() + 15.0)
        .max_by_key(|&(_, &n)| n)
        .map(|(&c, _)| c)
        .unwrap_or(thin);

    (Some(thin), Some(thick))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// White page with vertical pink lines every `spacing` px; every fifth
    /// line darker, as on real ECG paper.
    fn grid_image(w: u32, h: u32, spacing: u32) -> EcgImage {
        let mut img = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));
        for x in (0..w).step_by(spacing as usize) {
            let thick = (x / spacing) % 5 == 0;
            let color = if thick {
                Rgba([235, 140, 150, 255])
            } else {
                Rgba([250, 200, 205, 255])
            };
            for y in 0..h {
                img.put_pixel(x, y, color);
            }
        }
        EcgImage::from_image(img)
    }

    #[test]
    fn detects_small_box_spacing_on_clean_grid() {
        let img = grid_image(600, 300, 10);
        let info = detect_grid(&img);
        assert!(info.detected);
        assert_eq!(info.small_box_px, 10.0);
        assert_eq!(info.large_box_px, 50.0);
        assert!(info.confidence > 0.6, "confidence {}", info.confidence);
    }

    #[test]
    fn blank_page_reports_undetected_with_low_confidence() {
        let img = crate::image::solid_image(500, 400, Color::WHITE);
        let info = detect_grid(&img);
        assert!(!info.detected);
        assert!(info.confidence < 0.4);
    }

    #[test]
    fn grid_predicate_rejects_waveform_and_background() {
        let bg = Color::WHITE;
        assert!(!is_grid_line(Color::new(20, 20, 20), bg), "ink is not grid");
        assert!(!is_grid_line(Color::new(250, 250, 250), bg), "paper is not grid");
        assert!(is_grid_line(Color::new(250, 200, 205), bg), "pink line");
        assert!(is_grid_line(Color::new(120, 130, 220), bg), "blue line");
        assert!(is_grid_line(Color::new(180, 180, 180), bg), "gray line");
    }

    #[test]
    fn interval_mode_picks_most_common_spacing() {
        let intervals = vec![10, 10, 10, 9, 11, 50, 10];
        assert_eq!(interval_mode(&intervals), Some((10, 4)));
        assert_eq!(interval_mode(&[]), None);
    }

    #[test]
    fn implausible_spacing_is_not_detected() {
        // 40 px spacing → 40 px/mm, beyond any realistic scan.
        let img = grid_image(2000, 300, 40);
        let info = detect_grid(&img);
        assert!(!info.detected);
    }
}
