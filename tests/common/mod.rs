//! Synthetic ECG page renderer shared by the end-to-end scenarios.
//!
//! Pages are drawn the way thermal printers lay them out: a pink
//! millimeter grid, a 3×4 (or 3×5) panel matrix of QRS-plus-T-wave
//! tracings in black ink, and optionally a 1 mV calibration pulse at the
//! left margin. Limb leads are generated so Einthoven's identities hold
//! exactly in the rendered truth.

use ecg_digitizer::panel::standard_lead_at;
use ecg_digitizer::{EcgFormat, EcgImage, Lead};
use image::{Rgba, RgbaImage};

pub const GAIN_MM_PER_MV: f64 = 10.0;
pub const SPEED_MM_PER_S: f64 = 25.0;

const GRID_PINK: Rgba<u8> = Rgba([250, 200, 205, 255]);
const INK: Rgba<u8> = Rgba([10, 10, 10, 255]);

#[derive(Clone)]
pub struct RenderSpec {
    pub width: u32,
    pub height: u32,
    pub rows: usize,
    pub cols: usize,
    /// Grid spacing in pixels; doubles as px-per-mm.
    pub spacing_px: u32,
    /// Ink margin inside each cell.
    pub margin_x: i32,
    /// Override where column 0's ink starts (to clear the pulse area).
    pub first_col_ink_start: Option<i32>,
    /// Calibration pulse: (x0, width, height_px).
    pub pulse: Option<(i32, i32, i32)>,
}

impl RenderSpec {
    pub fn twelve_lead() -> Self {
        RenderSpec {
            width: 1600,
            height: 900,
            rows: 3,
            cols: 4,
            spacing_px: 5,
            margin_x: 45,
            first_col_ink_start: None,
            pulse: None,
        }
    }

    pub fn format(&self) -> EcgFormat {
        match (self.rows, self.cols) {
            (3, 4) => EcgFormat::TwelveLead,
            (3, 5) => EcgFormat::FifteenLeadPediatric,
            _ => EcgFormat::Unknown,
        }
    }

    pub fn px_per_mv(&self) -> f64 {
        self.spacing_px as f64 * GAIN_MM_PER_MV
    }

    pub fn px_per_second(&self) -> f64 {
        self.spacing_px as f64 * SPEED_MM_PER_S
    }

    /// Seconds of signal each panel displays.
    pub fn panel_seconds(&self) -> f64 {
        let cell_w = self.width as i32 / self.cols as i32;
        (cell_w - 2 * self.margin_x) as f64 / self.px_per_second()
    }
}

// ── Waveform truth ────────────────────────────────────────────────────────

/// Triangular QRS: onset at 0.15 s into each 0.8 s beat, 40 ms rise,
/// 40 ms fall, unit amplitude.
fn qrs(t: f64) -> f64 {
    let phase = (t - 0.15).rem_euclid(0.8);
    if phase < 0.04 {
        phase / 0.04
    } else if phase < 0.08 {
        (0.08 - phase) / 0.04
    } else {
        0.0
    }
}

/// Half-sine T wave from 0.25 s to 0.45 s into each beat, unit amplitude.
fn t_wave(t: f64) -> f64 {
    let phase = (t - 0.15).rem_euclid(0.8);
    if (0.25..0.45).contains(&phase) {
        ((phase - 0.25) / 0.2 * std::f64::consts::PI).sin()
    } else {
        0.0
    }
}

/// Rendered truth in millivolts. I and II are chosen freely; the other
/// limb leads follow Einthoven / Goldberger so the identities hold.
pub fn lead_mv(lead: Lead, t: f64) -> f64 {
    let (q, tw) = match lead {
        Lead::I => (0.70, 0.150),
        Lead::II => (0.50, 0.200),
        Lead::III => (-0.20, 0.050),
        Lead::AVR => (-0.60, -0.175),
        Lead::AVL => (0.45, 0.050),
        Lead::AVF => (0.15, 0.125),
        Lead::V1 => (-0.50, 0.100),
        Lead::V2 => (-0.30, 0.100),
        Lead::V3 => (0.30, 0.100),
        Lead::V4 => (0.60, 0.100),
        Lead::V5 => (0.80, 0.100),
        Lead::V6 => (1.00, 0.100),
        Lead::V3R => (-0.30, 0.080),
        Lead::V4R => (-0.25, 0.080),
        Lead::V7 => (0.35, 0.080),
    };
    q * qrs(t) + tw * t_wave(t)
}

// ── Rendering ─────────────────────────────────────────────────────────────

pub fn render(spec: &RenderSpec) -> EcgImage {
    let mut img = RgbaImage::from_pixel(spec.width, spec.height, Rgba([255, 255, 255, 255]));

    // Millimeter grid, both directions.
    for x in (0..spec.width).step_by(spec.spacing_px as usize) {
        for y in 0..spec.height {
            img.put_pixel(x, y, GRID_PINK);
        }
    }
    for y in (0..spec.height).step_by(spec.spacing_px as usize) {
        for x in 0..spec.width {
            img.put_pixel(x, y, GRID_PINK);
        }
    }

    // Panels.
    let cell_w = spec.width as i32 / spec.cols as i32;
    let cell_h = spec.height as i32 / spec.rows as i32;
    let px_per_mv = spec.px_per_mv();
    let px_per_s = spec.px_per_second();
    for row in 0..spec.rows {
        for col in 0..spec.cols {
            let Some(lead) = standard_lead_at(spec.format(), row, col) else { continue };
            let cell_x = col as i32 * cell_w;
            let x0 = if col == 0 {
                spec.first_col_ink_start.unwrap_or(cell_x + spec.margin_x)
            } else {
                cell_x + spec.margin_x
            };
            let x1 = cell_x + cell_w - spec.margin_x;
            let baseline = (row as i32 * cell_h + cell_h / 2) as f64;

            for x in x0..x1 {
                let t = (x - x0) as f64 / px_per_s;
                let y = (baseline - lead_mv(lead, t) * px_per_mv).round() as i32;
                for dy in -1..=1 {
                    let py = (y + dy).clamp(0, spec.height as i32 - 1);
                    img.put_pixel(x as u32, py as u32, INK);
                }
            }
        }
    }

    // Calibration pulse.
    if let Some((px, pw, ph)) = spec.pulse {
        let y0 = cell_h / 2 - ph / 2;
        for y in y0..y0 + ph {
            img.put_pixel(px as u32, y as u32, INK);
            img.put_pixel((px + pw) as u32, y as u32, INK);
        }
        for x in px..=px + pw {
            img.put_pixel(x as u32, y0 as u32, INK);
            img.put_pixel(x as u32, (y0 + ph - 1) as u32, INK);
        }
    }

    EcgImage::from_image(img)
}

// ── Comparison helpers ────────────────────────────────────────────────────

pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 2 {
        return 0.0;
    }
    let (a, b) = (&a[..n], &b[..n]);
    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= 0.0 || var_b <= 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

/// Rendered truth for a lead at the digitizer's sample times, in µV.
pub fn truth_samples(lead: Lead, n: usize, sample_rate: f64) -> Vec<f64> {
    (0..n).map(|i| lead_mv(lead, i as f64 / sample_rate) * 1000.0).collect()
}
