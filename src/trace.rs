use serde::{Deserialize, Serialize};

use crate::config::TracerConfig;
use crate::geom::Bounds;
use crate::image::EcgImage;

// ── Constants ─────────────────────────────────────────────────────────────

/// Vertical runs thicker than this are text labels or blotches, not trace.
const MAX_RUN_THICKNESS: i32 = 12;

/// Minimum summed centroid weight for a column estimate to count.
const MIN_WEIGHT_SUM: f64 = 0.5;

/// Confidence assigned to interpolated gap samples.
const INTERPOLATED_CONFIDENCE: f64 = 0.5;

/// Single-sample excursions beyond this many pixels, immediately undone,
/// are speckle artifacts.
const ARTIFACT_DELTA: f64 = 30.0;

/// Fewer samples than this and the trace is unusable.
pub const MIN_TRACE_POINTS: usize = 10;

// ── RawTrace ──────────────────────────────────────────────────────────────

/// Pixel-domain waveform extracted from one panel: parallel x / y /
/// confidence arrays with strictly increasing x, plus the gaps that could
/// not be bridged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTrace {
    pub xs: Vec<f64>,
    pub ys: Vec<f64>,
    pub confidence: Vec<f64>,
    pub baseline_y: f64,
    /// Unfilled gaps as (start_x, end_x) inclusive column ranges.
    pub gaps: Vec<(f64, f64)>,
    pub bounds: Bounds,
}

impl RawTrace {
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    pub fn usable(&self) -> bool {
        self.len() >= MIN_TRACE_POINTS
    }

    pub fn mean_confidence(&self) -> f64 {
        if self.confidence.is_empty() {
            0.0
        } else {
            self.confidence.iter().sum::<f64>() / self.confidence.len() as f64
        }
    }

    /// Dedup score: point count × mean confidence. Between two extractions
    /// of the same lead, the denser and more confident one wins.
    pub fn quality_score(&self) -> f64 {
        self.len() as f64 * self.mean_confidence()
    }

    pub fn total_gap_width(&self) -> f64 {
        self.gaps.iter().map(|&(a, b)| b - a + 1.0).sum()
    }

    pub fn span_width(&self) -> f64 {
        match (self.xs.first(), self.xs.last()) {
            (Some(&a), Some(&b)) => b - a + 1.0,
            _ => 0.0,
        }
    }
}

// ── Per-column estimate ───────────────────────────────────────────────────

fn pixel_score(img: &EcgImage, x: i32, y: i32, cfg: &TracerConfig) -> f64 {
    match cfg.waveform_color {
        Some(color) => img.color_match(x, y, color),
        None => img.darkness(x, y),
    }
}

/// Estimate the waveform's y position in one column: collect dark runs,
/// drop over-thick ones, take the run nearest the baseline (gridline
/// crossings produce extra runs; the baseline disambiguates), then return
/// the darkness-weighted centroid and a confidence from peak darkness.
pub fn column_estimate(
    img: &EcgImage,
    bounds: Bounds,
    x: i32,
    baseline_y: f64,
    cfg: &TracerConfig,
) -> Option<(f64, f64)> {
    let mut best: Option<(i32, i32)> = None;
    let mut best_dist = f64::MAX;

    let mut run_start: Option<i32> = None;
    for y in bounds.y..=bounds.bottom() {
        let dark = y < bounds.bottom() && pixel_score(img, x, y, cfg) >= cfg.darkness_threshold;
        match (dark, run_start) {
            (true, None) => run_start = Some(y),
            (false, Some(y0)) => {
                let thickness = y - y0;
                if thickness <= MAX_RUN_THICKNESS {
                    let center = (y0 + y) as f64 / 2.0;
                    let dist = (center - baseline_y).abs();
                    if dist < best_dist {
                        best_dist = dist;
                        best = Some((y0, y));
                    }
                }
                run_start = None;
            }
            _ => {}
        }
    }

    let (y0, y1) = best?;
    let mut weight_sum = 0.0;
    let mut weighted_y = 0.0;
    let mut max_score: f64 = 0.0;
    for y in y0..y1 {
        let score = pixel_score(img, x, y, cfg);
        let w = score / 255.0;
        weight_sum += w;
        weighted_y += y as f64 * w;
        max_score = max_score.max(score);
    }
    if weight_sum <= MIN_WEIGHT_SUM {
        return None;
    }
    let centroid = weighted_y / weight_sum;
    let confidence = (max_score / 200.0).min(1.0);
    Some((centroid, confidence))
}

// ── Panel sweep ───────────────────────────────────────────────────────────

/// Sweep every column of the panel, bridging small gaps by interpolation
/// and recording the rest, then apply artifact rejection and smoothing.
pub fn trace_panel(
    img: &EcgImage,
    bounds: Bounds,
    baseline_y: f64,
    cfg: &TracerConfig,
) -> RawTrace {
    let bounds = bounds.clamp_to(img.width(), img.height());
    let mut xs: Vec<f64> = Vec::with_capacity(bounds.width.max(0) as usize);
    let mut ys: Vec<f64> = Vec::with_capacity(xs.capacity());
    let mut confidence: Vec<f64> = Vec::with_capacity(xs.capacity());
    let mut gaps: Vec<(f64, f64)> = Vec::new();

    for x in bounds.x..bounds.right() {
        let Some((y, conf)) = column_estimate(img, bounds, x, baseline_y, cfg) else {
            continue;
        };
        if conf < cfg.min_point_confidence {
            continue;
        }

        if let (Some(&last_x), Some(&last_y)) = (xs.last(), ys.last()) {
            let missing = (x as f64 - last_x - 1.0) as i32;
            if missing > 0 {
                if missing <= cfg.max_interpolate_gap {
                    // Bridge pixel-by-pixel between the surviving neighbors.
                    for step in 1..=missing {
                        let t = step as f64 / (missing + 1) as f64;
                        xs.push(last_x + step as f64);
                        ys.push(last_y + (y - last_y) * t);
                        confidence.push(INTERPOLATED_CONFIDENCE);
                    }
                } else {
                    gaps.push((last_x + 1.0, x as f64 - 1.0));
                }
            }
        }
        xs.push(x as f64);
        ys.push(y);
        confidence.push(conf);
    }

    if cfg.reject_artifacts {
        reject_spikes(&mut xs, &mut ys, &mut confidence);
    }
    smooth(&mut ys, cfg.smoothing_window);
    smooth(&mut confidence, cfg.smoothing_window);

    RawTrace { xs, ys, confidence, baseline_y, gaps, bounds }
}

/// Drop single-sample excursions: a jump of more than `ARTIFACT_DELTA`
/// that immediately reverses direction.
fn reject_spikes(xs: &mut Vec<f64>, ys: &mut Vec<f64>, confidence: &mut Vec<f64>) {
    if ys.len() < 3 {
        return;
    }
    let keep: Vec<bool> = (0..ys.len())
        .map(|i| {
            if i == 0 || i + 1 == ys.len() {
                return true;
            }
            let d1 = ys[i] - ys[i - 1];
            let d2 = ys[i + 1] - ys[i];
            !(d1.abs() > ARTIFACT_DELTA && d2.abs() > ARTIFACT_DELTA && d1 * d2 < 0.0)
        })
        .collect();
    let mut idx = 0;
    xs.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    idx = 0;
    ys.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    idx = 0;
    confidence.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
}

/// Centered moving average with shrinking windows at the edges.
fn smooth(values: &mut [f64], window: usize) {
    if window < 2 || values.len() < window {
        return;
    }
    let half = window / 2;
    let source = values.to_vec();
    for i in 0..source.len() {
        let lo = i.saturating_sub(half);
        let hi = (i + half + 1).min(source.len());
        values[i] = source[lo..hi].iter().sum::<f64>() / (hi - lo) as f64;
    }
}
