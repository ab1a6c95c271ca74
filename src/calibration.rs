use serde::{Deserialize, Serialize};

use crate::geom::Bounds;
use crate::grid::GridInfo;
use crate::image::EcgImage;
use crate::panel::Panel;

// ── Constants ─────────────────────────────────────────────────────────────

/// Fraction of image width scanned for the reference pulse. Printers place
/// it at the very start of the tracing.
const PULSE_SEARCH_FRACTION: f64 = 0.15;

/// Darkness above which a pixel belongs to a pulse edge.
const PULSE_DARKNESS: f64 = 100.0;

/// Acceptable vertical edge lengths (px) for a 1 mV pulse.
const MIN_EDGE_LEN: i32 = 20;
const MAX_EDGE_LEN: i32 = 200;

/// Default vertical scale: 10 mm per mV.
const STANDARD_GAIN: f64 = 10.0;

/// Standard and fast paper speeds (mm per second).
const STANDARD_SPEED: f64 = 25.0;
const FAST_SPEED: f64 = 50.0;

/// Seconds of signal a main-grid panel conventionally displays.
const PANEL_SECONDS: f64 = 2.5;

/// Pulse-vs-panel px-per-mm disagreement beyond this rejects the pulse.
const CONSISTENCY_TOLERANCE: f64 = 0.30;

/// Plausible px-per-mm band for the panel-width estimate.
const PANEL_PX_PER_MM_RANGE: std::ops::RangeInclusive<f64> = 3.0..=15.0;

/// Plausible px-per-mV band for the amplitude fallback.
const AMPLITUDE_PX_PER_MV_RANGE: std::ops::RangeInclusive<f64> = 10.0..=200.0;

// ── Types ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationSource {
    Pulse,
    TextLabel,
    StandardAssumed,
    UserInput,
}

/// Voltage / time scale of the tracing. The derived quantities obey
/// `px_per_mv = px_per_mm × gain` and `px_per_second = px_per_mm × speed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calibration {
    pub gain_mm_per_mv: f64,
    pub paper_speed_mm_per_s: f64,
    pub gain_source: CalibrationSource,
    pub speed_source: CalibrationSource,
    pub px_per_mm: f64,
    pub confidence: f64,
}

impl Calibration {
    pub fn px_per_mv(&self) -> f64 {
        self.px_per_mm * self.gain_mm_per_mv
    }

    pub fn px_per_second(&self) -> f64 {
        self.px_per_mm * self.paper_speed_mm_per_s
    }
}

/// A located 1 mV reference pulse. Its height in pixels is px-per-mV.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulseDetection {
    pub bounds: Bounds,
    pub px_per_mv: f64,
    pub confidence: f64,
}

// ── Pulse detection ───────────────────────────────────────────────────────

/// A vertical run of dark pixels in one column.
#[derive(Debug, Clone, Copy)]
struct VerticalRun {
    x: i32,
    y0: i32,
    y1: i32, // exclusive
}

impl VerticalRun {
    fn len(&self) -> i32 {
        self.y1 - self.y0
    }
}

fn collect_vertical_runs(img: &EcgImage, x_max: i32) -> Vec<VerticalRun> {
    let h = img.height() as i32;
    let mut runs = Vec::new();
    for x in 0..x_max {
        let mut start: Option<i32> = None;
        for y in 0..=h {
            let dark = y < h && img.darkness(x, y) >= PULSE_DARKNESS;
            match (dark, start) {
                (true, None) => start = Some(y),
                (false, Some(y0)) => {
                    let run = VerticalRun { x, y0, y1: y };
                    if (MIN_EDGE_LEN..=MAX_EDGE_LEN).contains(&run.len()) {
                        runs.push(run);
                    }
                    start = None;
                }
                _ => {}
            }
        }
    }
    runs
}

/// Fraction of dark pixels along the row `y` between two columns.
fn horizontal_coverage(img: &EcgImage, y: i32, x0: i32, x1: i32) -> f64 {
    if x1 <= x0 {
        return 0.0;
    }
    let dark = (x0..=x1).filter(|&x| img.darkness(x, y) >= PULSE_DARKNESS).count();
    dark as f64 / (x1 - x0 + 1) as f64
}

/// Locate the 1 mV rectangular reference pulse in the leftmost strip of the
/// image: two parallel vertical edges of comparable length, joined by
/// horizontal top and bottom edges.
pub fn detect_pulse(img: &EcgImage) -> Option<PulseDetection> {
    let x_max = ((img.width() as f64 * PULSE_SEARCH_FRACTION) as i32).max(1);
    let runs = collect_vertical_runs(img, x_max);

    let mut best: Option<PulseDetection> = None;
    for (i, left) in runs.iter().enumerate() {
        for right in runs.iter().skip(i + 1) {
            if right.x <= left.x {
                continue;
            }
            let mean_height = (left.len() + right.len()) as f64 / 2.0;
            let gap = (right.x - left.x) as f64;

            if (left.len() - right.len()).abs() > 10 {
                continue;
            }
            let overlap = (left.y1.min(right.y1) - left.y0.max(right.y0)).max(0) as f64;
            if overlap < 0.8 * mean_height {
                continue;
            }
            if gap < 5.0 || gap > 2.0 * mean_height {
                continue;
            }
            let aspect = gap / mean_height;
            if !(0.1..=1.0).contains(&aspect) {
                continue;
            }

            let top = left.y0.max(right.y0);
            let bottom = left.y1.min(right.y1) - 1;
            let mut confidence = 0.5;
            if horizontal_coverage(img, top, left.x, right.x) >= 0.8 {
                confidence += 0.2;
            }
            if horizontal_coverage(img, bottom, left.x, right.x) >= 0.8 {
                confidence += 0.2;
            }
            if (left.len() - right.len()).abs() <= 2 {
                confidence += 0.1;
            }

            let candidate = PulseDetection {
                bounds: Bounds::new(
                    left.x,
                    left.y0.min(right.y0),
                    right.x - left.x + 1,
                    left.y1.max(right.y1) - left.y0.min(right.y0),
                ),
                px_per_mv: mean_height,
                confidence,
            };
            if best.as_ref().map_or(true, |b| candidate.confidence > b.confidence) {
                best = Some(candidate);
            }
        }
    }
    best
}

// ── Fallback estimates ────────────────────────────────────────────────────

/// Px-per-mm and paper speed inferred from panel widths, assuming each main
/// panel shows 2.5 s of signal. The speed whose estimate lands in the
/// plausible band wins; 25 mm/s is preferred when both do.
pub fn panel_width_px_per_mm(panels: &[Panel]) -> Option<(f64, f64)> {
    let mut widths: Vec<f64> = panels
        .iter()
        .filter(|p| !p.is_rhythm_strip)
        .map(|p| p.bounds.width as f64)
        .collect();
    if widths.is_empty() {
        return None;
    }
    widths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = widths[widths.len() / 2];

    for speed in [STANDARD_SPEED, FAST_SPEED] {
        let estimate = median / (PANEL_SECONDS * speed);
        if PANEL_PX_PER_MM_RANGE.contains(&estimate) {
            return Some((estimate, speed));
        }
    }
    None
}

/// Last-resort scale from page width, assuming an 11-inch-wide printout.
pub fn page_width_px_per_mm(img_width: u32) -> f64 {
    img_width as f64 / (11.0 * 25.4)
}

/// 90th-percentile peak-to-peak waveform extent across panels, mapped to
/// px-per-mV under the assumption of a typical 1.5 mV QRS.
pub fn amplitude_px_per_mv(img: &EcgImage, panels: &[Panel]) -> Option<f64> {
    let mut extents: Vec<f64> = Vec::new();
    for panel in panels {
        let b = panel.bounds.clamp_to(img.width(), img.height());
        let mut best = 0i32;
        for x in (b.x..b.right()).step_by(2) {
            let mut top = i32::MAX;
            let mut bottom = i32::MIN;
            for y in b.y..b.bottom() {
                if img.darkness(x, y) >= PULSE_DARKNESS {
                    top = top.min(y);
                    bottom = bottom.max(y);
                }
            }
            if bottom > top {
                best = best.max(bottom - top);
            }
        }
        if best > 0 {
            extents.push(best as f64);
        }
    }
    if extents.is_empty() {
        return None;
    }
    extents.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let p90 = extents[((extents.len() - 1) as f64 * 0.9).round() as usize];
    let px_per_mv = p90 / 1.5;
    AMPLITUDE_PX_PER_MV_RANGE.contains(&px_per_mv).then_some(px_per_mv)
}

// ── Resolution ────────────────────────────────────────────────────────────

/// Combine grid geometry, the detected pulse, and panel-based estimates
/// into the final calibration. Returns the calibration and whether a found
/// pulse had to be rejected for inconsistency.
pub fn resolve_calibration(
    img: &EcgImage,
    grid: &GridInfo,
    panels: &[Panel],
    pulse: Option<&PulseDetection>,
) -> (Calibration, bool) {
    let panel_estimate = panel_width_px_per_mm(panels);
    let (panel_px_per_mm, paper_speed) =
        panel_estimate.unwrap_or((page_width_px_per_mm(img.width()), STANDARD_SPEED));

    // Geometric scale: the grid is the most direct witness when present.
    let px_per_mm = if grid.detected { grid.px_per_mm } else { panel_px_per_mm };

    // Pulse consistency: its implied px-per-mm must agree with the
    // panel-width estimate (or, failing one, the grid scale) to within ±30%.
    let consistency_ref = match panel_estimate {
        Some((est, _)) => est,
        None if grid.detected => grid.px_per_mm,
        None => panel_px_per_mm,
    };
    let mut pulse_rejected = false;
    if let Some(p) = pulse {
        let pulse_px_per_mm = p.px_per_mv / STANDARD_GAIN;
        let deviation = (pulse_px_per_mm - consistency_ref).abs() / consistency_ref.max(1e-6);
        if deviation <= CONSISTENCY_TOLERANCE {
            let gain = p.px_per_mv / px_per_mm;
            let cal = Calibration {
                gain_mm_per_mv: gain,
                paper_speed_mm_per_s: paper_speed,
                gain_source: CalibrationSource::Pulse,
                speed_source: CalibrationSource::StandardAssumed,
                px_per_mm,
                confidence: p.confidence.max(0.5),
            };
            return (cal, false);
        }
        tracing::warn!(
            pulse_px_per_mm,
            consistency_ref,
            "calibration pulse disagrees with panel geometry; rejected"
        );
        pulse_rejected = true;
    }

    // No usable pulse: standard gain, optionally refined by the waveform
    // amplitude heuristic when the geometric scale is itself a guess.
    // A rejected pulse substitutes the panel-width estimate outright.
    let mut px_per_mm = if pulse_rejected { panel_px_per_mm } else { px_per_mm };
    let mut confidence = if pulse_rejected {
        if panel_estimate.is_some() { 0.5 } else { 0.3 }
    } else if grid.detected {
        0.6_f64.max(grid.confidence * 0.8)
    } else if panel_estimate.is_some() {
        0.5
    } else {
        0.3
    };
    if !grid.detected && panel_estimate.is_none() {
        if let Some(px_per_mv) = amplitude_px_per_mv(img, panels) {
            px_per_mm = px_per_mv / STANDARD_GAIN;
            confidence = 0.4;
        }
    }

    let cal = Calibration {
        gain_mm_per_mv: STANDARD_GAIN,
        paper_speed_mm_per_s: paper_speed,
        gain_source: CalibrationSource::StandardAssumed,
        speed_source: CalibrationSource::StandardAssumed,
        px_per_mm,
        confidence,
    };
    (cal, pulse_rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::Color;
    use image::{Rgba, RgbaImage};

    /// White page with a rectangular pulse outline at the left margin.
    fn pulse_image(height_px: u32, width_px: u32) -> EcgImage {
        let mut img = RgbaImage::from_pixel(400, 300, Rgba([255, 255, 255, 255]));
        let (x0, y0) = (10u32, 100u32);
        let ink = Rgba([0, 0, 0, 255]);
        for y in y0..y0 + height_px {
            img.put_pixel(x0, y, ink);
            img.put_pixel(x0 + width_px, y, ink);
        }
        for x in x0..=x0 + width_px {
            img.put_pixel(x, y0, ink);
            img.put_pixel(x, y0 + height_px - 1, ink);
        }
        EcgImage::from_image(img)
    }

    #[test]
    fn finds_clean_pulse_with_full_confidence() {
        let img = pulse_image(30, 15);
        let pulse = detect_pulse(&img).expect("pulse");
        assert!((pulse.px_per_mv - 30.0).abs() <= 1.0);
        assert!(pulse.confidence >= 0.9, "confidence {}", pulse.confidence);
    }

    #[test]
    fn ignores_rectangles_outside_aspect_range() {
        // 30 px tall but only 2 px wide: gap below the 5 px minimum.
        let img = pulse_image(30, 2);
        assert!(detect_pulse(&img).is_none());
    }

    #[test]
    fn blank_image_has_no_pulse() {
        let img = crate::image::solid_image(400, 300, Color::WHITE);
        assert!(detect_pulse(&img).is_none());
    }

    #[test]
    fn consistent_pulse_sets_gain_source() {
        // 3 px/mm grid, 30 px pulse, panels 187 px wide (2.5 s at 25 mm/s).
        let img = pulse_image(30, 15);
        let mut grid = GridInfo::undetected(Color::WHITE);
        grid.detected = true;
        grid.px_per_mm = 3.0;
        grid.confidence = 0.9;
        let panels: Vec<Panel> = (0..4)
            .map(|i| Panel::new(i, crate::geom::Bounds::new(i as i32 * 195, 0, 190, 60)))
            .collect();
        let pulse = PulseDetection {
            bounds: crate::geom::Bounds::new(10, 100, 16, 30),
            px_per_mv: 30.0,
            confidence: 1.0,
        };
        let (cal, rejected) = resolve_calibration(&img, &grid, &panels, Some(&pulse));
        assert!(!rejected);
        assert_eq!(cal.gain_source, CalibrationSource::Pulse);
        assert!((cal.px_per_mm - 3.0).abs() < 0.3);
        assert!((cal.gain_mm_per_mv - 10.0).abs() < 0.5);
        assert!((cal.px_per_mv() - 30.0).abs() < 1.0);
    }

    #[test]
    fn inconsistent_pulse_is_rejected_for_panel_estimate() {
        let img = pulse_image(30, 15);
        let grid = GridInfo::undetected(Color::WHITE);
        let panels: Vec<Panel> = (0..4)
            .map(|i| Panel::new(i, crate::geom::Bounds::new(i as i32 * 320, 0, 312, 80)))
            .collect();
        // Panels say 312 / 62.5 ≈ 5 px/mm; a 30 px pulse says 3 px/mm.
        let pulse = PulseDetection {
            bounds: crate::geom::Bounds::new(10, 100, 16, 30),
            px_per_mv: 30.0,
            confidence: 1.0,
        };
        let (cal, rejected) = resolve_calibration(&img, &grid, &panels, Some(&pulse));
        assert!(rejected);
        assert_eq!(cal.gain_source, CalibrationSource::StandardAssumed);
        assert!((cal.px_per_mm - 4.992).abs() < 0.05);
    }

    #[test]
    fn rejected_pulse_overrides_grid_with_panel_scale() {
        let img = pulse_image(30, 15);
        let mut grid = GridInfo::undetected(Color::WHITE);
        grid.detected = true;
        grid.px_per_mm = 8.0;
        grid.confidence = 0.9;
        // Panels say ≈5 px/mm; the 30 px pulse says 3 px/mm → rejected,
        // and the panel estimate must also displace the grid scale.
        let panels: Vec<Panel> = (0..4)
            .map(|i| Panel::new(i, crate::geom::Bounds::new(i as i32 * 320, 0, 312, 80)))
            .collect();
        let pulse = PulseDetection {
            bounds: crate::geom::Bounds::new(10, 100, 16, 30),
            px_per_mv: 30.0,
            confidence: 1.0,
        };
        let (cal, rejected) = resolve_calibration(&img, &grid, &panels, Some(&pulse));
        assert!(rejected);
        assert_eq!(cal.gain_source, CalibrationSource::StandardAssumed);
        assert!((cal.px_per_mm - 4.992).abs() < 0.05, "px_per_mm {}", cal.px_per_mm);
        assert_eq!(cal.paper_speed_mm_per_s, 25.0);
    }

    #[test]
    fn page_width_fallback_matches_letter_paper() {
        // 2794 px across 11 inches → 10 px/mm.
        assert!((page_width_px_per_mm(2794) - 10.0).abs() < 0.01);
    }
}
