use std::collections::BTreeMap;

use crate::lead::Lead;
use crate::panel::EcgFormat;
use crate::report::{Issue, IssueCode, Severity};
use crate::signal::{EcgSignal, LeadTrace};

// ── Constants ─────────────────────────────────────────────────────────────

/// Per-lead confidence below this raises LOW_LEAD_CONFIDENCE.
const LOW_LEAD_BAR: f64 = 0.5;

/// Variance below this (µV²) is a flat line — an unconnected electrode or
/// a trace that never left the baseline.
const FLAT_LINE_VARIANCE: f64 = 1.0;

/// Peak-to-peak range beyond this (µV) suggests amplifier saturation.
const SATURATION_RANGE: f64 = 10_000.0;

/// Ratio of first-difference amplitude to overall deviation beyond which
/// the lead is mostly high-frequency noise.
const NOISE_RATIO: f64 = 0.5;

// ── Per-lead score ────────────────────────────────────────────────────────

/// Weighted per-lead confidence from trace statistics:
/// 0.4·point confidence + 0.3·gap term + 0.2·coverage + 0.1·label.
pub fn lead_confidence(trace: &LeadTrace, panel_width: f64, label_confidence: f64) -> f64 {
    let t = &trace.trace;
    let span = t.span_width().max(1.0);
    let gap_term = 1.0 - (t.total_gap_width() / span).min(0.5);
    let coverage = (span / panel_width.max(1.0)).min(1.0);
    0.4 * t.mean_confidence() + 0.3 * gap_term + 0.2 * coverage + 0.1 * label_confidence
}

// ── Signal statistics ─────────────────────────────────────────────────────

struct SignalStats {
    variance: f64,
    range: f64,
    noise_ratio: f64,
}

fn stats_of(samples: &[f64]) -> SignalStats {
    if samples.len() < 2 {
        return SignalStats { variance: 0.0, range: 0.0, noise_ratio: 0.0 };
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|&v| (v - mean) * (v - mean)).sum::<f64>() / n;
    let min = samples.iter().cloned().fold(f64::MAX, f64::min);
    let max = samples.iter().cloned().fold(f64::MIN, f64::max);

    let mean_abs_dev = samples.iter().map(|&v| (v - mean).abs()).sum::<f64>() / n;
    let mean_abs_diff =
        samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f64>() / (n - 1.0);
    let noise_ratio = if mean_abs_dev > 1e-9 { mean_abs_diff / mean_abs_dev } else { 0.0 };

    SignalStats { variance, range: max - min, noise_ratio }
}

// ── Assessment ────────────────────────────────────────────────────────────

pub struct QualityInput<'a> {
    pub traces: &'a [LeadTrace],
    /// Panel width (px) and label confidence per traced lead.
    pub panel_info: &'a BTreeMap<Lead, (f64, f64)>,
    pub signal: &'a EcgSignal,
    pub format: EcgFormat,
    pub calibration_confidence: f64,
    pub grid_confidence: f64,
    /// Oracle-reported image quality, when it gave one.
    pub image_quality: Option<f64>,
    pub apply_confidence_floors: bool,
}

pub struct QualityReport {
    pub overall: f64,
    pub per_lead: BTreeMap<Lead, f64>,
    pub issues: Vec<Issue>,
}

/// Score every extracted lead and the record overall, and emit the
/// diagnostic issues the caller can act on.
pub fn assess(input: &QualityInput) -> QualityReport {
    let mut per_lead: BTreeMap<Lead, f64> = BTreeMap::new();
    let mut issues: Vec<Issue> = Vec::new();

    for t in input.traces {
        let (panel_width, label_conf) =
            input.panel_info.get(&t.lead).copied().unwrap_or((t.trace.span_width(), 0.0));
        let conf = lead_confidence(t, panel_width, label_conf);
        per_lead.insert(t.lead, conf);
        if conf < LOW_LEAD_BAR {
            issues.push(
                Issue::new(
                    IssueCode::LowLeadConfidence,
                    Severity::Warning,
                    format!("lead {} extracted with confidence {conf:.2}", t.lead),
                )
                .with_leads(vec![t.lead]),
            );
        }
    }

    // Missing standard leads (the signal may still contain derived ones).
    let extracted: Vec<Lead> = input.signal.leads.keys().copied().collect();
    let missing: Vec<Lead> = Lead::STANDARD_12
        .iter()
        .copied()
        .filter(|l| !extracted.contains(l))
        .collect();
    if !missing.is_empty()
        && input.format != EcgFormat::SingleStrip
        && input.format != EcgFormat::RhythmOnly
    {
        let names: Vec<&str> = missing.iter().map(|l| l.name()).collect();
        issues.push(
            Issue::new(
                IssueCode::MissingLeads,
                Severity::Warning,
                format!("standard leads not recovered: {}", names.join(", ")),
            )
            .with_leads(missing.clone())
            .with_suggestion("Rescan at higher resolution or provide a cleaner image"),
        );
    }

    // Morphology sanity per reconstructed lead.
    for (lead, samples) in &input.signal.leads {
        let stats = stats_of(samples);
        if stats.variance < FLAT_LINE_VARIANCE && !samples.is_empty() {
            issues.push(
                Issue::new(
                    IssueCode::FlatLine,
                    Severity::Warning,
                    format!("lead {lead} is a flat line"),
                )
                .with_leads(vec![*lead]),
            );
        }
        if stats.range > SATURATION_RANGE {
            issues.push(
                Issue::new(
                    IssueCode::PossibleSaturation,
                    Severity::Warning,
                    format!("lead {lead} spans {:.1} mV; possible saturation", stats.range / 1000.0),
                )
                .with_leads(vec![*lead]),
            );
        }
        if stats.noise_ratio > NOISE_RATIO {
            issues.push(
                Issue::new(
                    IssueCode::ExcessiveNoise,
                    Severity::Warning,
                    format!("lead {lead} is dominated by high-frequency content"),
                )
                .with_leads(vec![*lead]),
            );
        }
    }

    // Overall score.
    let avg_lead = if per_lead.is_empty() {
        0.0
    } else {
        per_lead.values().sum::<f64>() / per_lead.len() as f64
    };
    let extracted_standard =
        Lead::STANDARD_12.iter().filter(|l| extracted.contains(*l)).count();
    let lead_coverage = extracted_standard as f64 / 12.0;
    let image_quality = input.image_quality.unwrap_or(0.5);

    let mut overall = 0.4 * avg_lead
        + 0.2 * input.calibration_confidence
        + 0.2 * input.grid_confidence
        + 0.1 * image_quality
        + 0.1 * lead_coverage;

    // Completeness floors: a fully extracted record is trustworthy even
    // when individual detector confidences ran low.
    if input.apply_confidence_floors {
        overall = match extracted_standard {
            12 => overall.max(0.95),
            10 | 11 => overall.max(0.90),
            6..=9 => overall.max(0.75),
            _ => overall,
        };
    }

    QualityReport { overall: overall.clamp(0.0, 1.0), per_lead, issues }
}
