use serde::{Deserialize, Serialize};

use crate::config::TracerConfig;
use crate::geom::Bounds;
use crate::image::EcgImage;
use crate::trace::column_estimate;

// ── Constants ─────────────────────────────────────────────────────────────

/// Bin width (px) of the first-dark-pixel histogram.
const HISTOGRAM_BIN: f64 = 3.0;

/// |slope| (px per column) below which a sample belongs to a flat segment.
const FLAT_SLOPE: f64 = 0.5;

/// Columns on each side used for the local slope estimate.
const SLOPE_HALF_WINDOW: i32 = 2;

/// Confidence bars for the selection cascade.
const FLAT_SEGMENT_BAR: f64 = 0.6;
const HISTOGRAM_BAR: f64 = 0.5;

/// Oracle-provided baselines are trusted only inside the middle band of
/// the panel (30%–70% of its height on each side of center).
const ORACLE_BAND_FRACTION: f64 = 0.6;

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMethod {
    FlatSegment,
    Histogram,
    Oracle,
    PanelCenter,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaselineEstimate {
    pub y: f64,
    pub confidence: f64,
    pub method: BaselineMethod,
}

// ── Estimators ────────────────────────────────────────────────────────────

/// Histogram method: the first dark pixel from the top of each column,
/// binned; the modal bin is where the waveform spends most of its time,
/// which for an ECG is the isoelectric line.
fn histogram_estimate(img: &EcgImage, bounds: Bounds, cfg: &TracerConfig) -> Option<BaselineEstimate> {
    let mut firsts: Vec<f64> = Vec::new();
    for x in bounds.x..bounds.right() {
        for y in bounds.y..bounds.bottom() {
            let score = match cfg.waveform_color {
                Some(c) => img.color_match(x, y, c),
                None => img.darkness(x, y),
            };
            if score >= cfg.darkness_threshold {
                firsts.push(y as f64);
                break;
            }
        }
    }
    if firsts.is_empty() {
        return None;
    }

    let min = firsts.iter().cloned().fold(f64::MAX, f64::min);
    let mut bins: std::collections::HashMap<i64, (usize, f64)> = std::collections::HashMap::new();
    for &y in &firsts {
        let bin = ((y - min) / HISTOGRAM_BIN) as i64;
        let entry = bins.entry(bin).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += y;
    }
    let (&_, &(count, sum)) = bins.iter().max_by_key(|&(_, &(n, _))| n)?;
    Some(BaselineEstimate {
        y: sum / count as f64,
        confidence: (count as f64 / (firsts.len() as f64 / 2.0)).min(1.0),
        method: BaselineMethod::Histogram,
    })
}

/// Flat-segment method: columns where the local slope of the traced
/// waveform is near zero are isoelectric; their median y is the baseline.
fn flat_segment_estimate(
    img: &EcgImage,
    bounds: Bounds,
    cfg: &TracerConfig,
) -> Option<BaselineEstimate> {
    let provisional = bounds.center().1;
    let mut samples: Vec<(i32, f64)> = Vec::new();
    for x in bounds.x..bounds.right() {
        if let Some((y, _)) = column_estimate(img, bounds, x, provisional, cfg) {
            samples.push((x, y));
        }
    }
    if samples.len() < (2 * SLOPE_HALF_WINDOW + 1) as usize {
        return None;
    }

    let mut flat_ys: Vec<f64> = Vec::new();
    for i in SLOPE_HALF_WINDOW as usize..samples.len() - SLOPE_HALF_WINDOW as usize {
        let (x0, y0) = samples[i - SLOPE_HALF_WINDOW as usize];
        let (x1, y1) = samples[i + SLOPE_HALF_WINDOW as usize];
        if x1 == x0 {
            continue;
        }
        let slope = (y1 - y0) / (x1 - x0) as f64;
        if slope.abs() < FLAT_SLOPE {
            flat_ys.push(samples[i].1);
        }
    }
    if flat_ys.is_empty() {
        return None;
    }
    flat_ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = flat_ys[flat_ys.len() / 2];
    let column_count = bounds.width.max(1) as f64;
    Some(BaselineEstimate {
        y: median,
        confidence: (flat_ys.len() as f64 / (0.3 * column_count)).min(1.0),
        method: BaselineMethod::FlatSegment,
    })
}

// ── Selection ─────────────────────────────────────────────────────────────

/// Run the estimators and pick by the confidence cascade: flat-segment
/// when strong, then histogram, then an oracle hint landing in the middle
/// band of the panel, then the panel center. The chosen y is clamped into
/// the panel.
pub fn detect_baseline(
    img: &EcgImage,
    bounds: Bounds,
    oracle_baseline: Option<f64>,
    cfg: &TracerConfig,
) -> BaselineEstimate {
    let bounds = bounds.clamp_to(img.width(), img.height());
    let center = bounds.center().1;

    let flat = flat_segment_estimate(img, bounds, cfg);
    let hist = histogram_estimate(img, bounds, cfg);

    let mut chosen = match (flat, hist) {
        (Some(f), _) if f.confidence > FLAT_SEGMENT_BAR => f,
        (_, Some(h)) if h.confidence > HISTOGRAM_BAR => h,
        _ => match oracle_baseline {
            Some(y) if in_middle_band(y, bounds) => BaselineEstimate {
                y,
                confidence: 0.5,
                method: BaselineMethod::Oracle,
            },
            _ => BaselineEstimate {
                y: center,
                confidence: 0.3,
                method: BaselineMethod::PanelCenter,
            },
        },
    };
    chosen.y = chosen.y.clamp(bounds.y as f64, bounds.bottom() as f64);
    chosen
}

fn in_middle_band(y: f64, bounds: Bounds) -> bool {
    let margin = bounds.height as f64 * (1.0 - ORACLE_BAND_FRACTION) / 2.0;
    y >= bounds.y as f64 + margin && y <= bounds.bottom() as f64 - margin
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// Flat line at `level` with one tall QRS-like spike.
    fn spiky_panel(w: u32, h: u32, level: u32) -> EcgImage {
        let mut img = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));
        for x in 0..w {
            let y = if (40..45).contains(&x) {
                level.saturating_sub(30 + 2 * (x - 40))
            } else {
                level
            };
            img.put_pixel(x, y.min(h - 2), Rgba([0, 0, 0, 255]));
            img.put_pixel(x, (y + 1).min(h - 1), Rgba([0, 0, 0, 255]));
        }
        EcgImage::from_image(img)
    }

    fn full_bounds(img: &EcgImage) -> Bounds {
        Bounds::new(0, 0, img.width() as i32, img.height() as i32)
    }

    #[test]
    fn flat_segment_wins_on_a_mostly_flat_trace() {
        let img = spiky_panel(200, 100, 60);
        let est = detect_baseline(&img, full_bounds(&img), None, &TracerConfig::default());
        assert_eq!(est.method, BaselineMethod::FlatSegment);
        assert!((est.y - 60.5).abs() < 2.0, "baseline {}", est.y);
        assert!(est.confidence > 0.6);
    }

    #[test]
    fn blank_panel_falls_back_to_center() {
        let img = crate::image::solid_image(100, 80, crate::geom::Color::WHITE);
        let est = detect_baseline(&img, full_bounds(&img), None, &TracerConfig::default());
        assert_eq!(est.method, BaselineMethod::PanelCenter);
        assert_eq!(est.y, 40.0);
        assert!((est.confidence - 0.3).abs() < 1e-9);
    }

    #[test]
    fn oracle_hint_is_used_when_pixels_are_uninformative() {
        let img = crate::image::solid_image(100, 80, crate::geom::Color::WHITE);
        let est =
            detect_baseline(&img, full_bounds(&img), Some(42.0), &TracerConfig::default());
        assert_eq!(est.method, BaselineMethod::Oracle);
        assert_eq!(est.y, 42.0);
    }

    #[test]
    fn oracle_hint_outside_middle_band_is_ignored() {
        let img = crate::image::solid_image(100, 80, crate::geom::Color::WHITE);
        let est =
            detect_baseline(&img, full_bounds(&img), Some(3.0), &TracerConfig::default());
        assert_eq!(est.method, BaselineMethod::PanelCenter);
    }

    #[test]
    fn result_is_always_inside_the_panel() {
        let img = spiky_panel(200, 100, 60);
        let est = detect_baseline(
            &img,
            Bounds::new(0, 0, 200, 100),
            Some(500.0),
            &TracerConfig::default(),
        );
        assert!((0.0..=100.0).contains(&est.y));
    }
}
