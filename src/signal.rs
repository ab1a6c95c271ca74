use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::lead::Lead;
use crate::trace::RawTrace;

// ── Types ─────────────────────────────────────────────────────────────────

/// A traced panel ready for reconstruction.
#[derive(Debug, Clone)]
pub struct LeadTrace {
    pub lead: Lead,
    /// Column of the panel grid; leads in one column share a time origin.
    pub col: usize,
    pub is_rhythm_strip: bool,
    pub trace: RawTrace,
}

/// The digitized record: one microvolt sample array per lead, uniformly
/// sampled. All arrays have the same length, `round(duration × rate)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcgSignal {
    pub sample_rate: f64,
    pub duration: f64,
    pub leads: BTreeMap<Lead, Vec<f64>>,
}

impl EcgSignal {
    pub fn empty(sample_rate: f64) -> Self {
        EcgSignal { sample_rate, duration: 0.0, leads: BTreeMap::new() }
    }
}

/// Reconstruction output: the signal plus each lead's covered time range.
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub signal: EcgSignal,
    pub time_ranges: BTreeMap<Lead, (f64, f64)>,
}

// ── Reconstruction ────────────────────────────────────────────────────────

/// Convert pixel traces to calibrated time/voltage series.
///
/// Leads in the same layout column share one time origin (the leftmost
/// traced x among them). Using each trace's own start instead would shift
/// simultaneous leads against each other and break Einthoven's identity
/// across the limb leads, so the shared origin is load-bearing.
pub fn reconstruct(traces: &[LeadTrace], cal: &Calibration, sample_rate: f64) -> Reconstruction {
    let px_per_second = cal.px_per_second();
    let px_per_mv = cal.px_per_mv();
    if px_per_second <= 0.0 || px_per_mv <= 0.0 || traces.is_empty() {
        return Reconstruction {
            signal: EcgSignal::empty(sample_rate),
            time_ranges: BTreeMap::new(),
        };
    }

    // Shared time origin per column.
    let mut column_min_x: HashMap<usize, f64> = HashMap::new();
    for t in traces {
        let Some(&first_x) = t.trace.xs.first() else { continue };
        column_min_x
            .entry(t.col)
            .and_modify(|m| *m = m.min(first_x))
            .or_insert(first_x);
    }

    // Continuous (time, microvolt) series per lead.
    struct Series {
        times: Vec<f64>,
        volts: Vec<f64>,
    }
    let mut series: BTreeMap<Lead, Series> = BTreeMap::new();
    let mut time_ranges: BTreeMap<Lead, (f64, f64)> = BTreeMap::new();
    let mut duration = 0.0f64;

    for t in traces {
        if t.trace.is_empty() {
            continue;
        }
        let origin = *column_min_x.get(&t.col).unwrap_or(&t.trace.xs[0]);
        let times: Vec<f64> = t.trace.xs.iter().map(|&x| (x - origin) / px_per_second).collect();
        let volts: Vec<f64> = t
            .trace
            .ys
            .iter()
            .map(|&y| (t.trace.baseline_y - y) / px_per_mv * 1000.0)
            .collect();
        let start = *times.first().unwrap_or(&0.0);
        let end = *times.last().unwrap_or(&0.0);
        duration = duration.max(end);
        time_ranges.insert(t.lead, (start, end));
        series.insert(t.lead, Series { times, volts });
    }

    let n_samples = (duration * sample_rate).round() as usize;
    if n_samples == 0 {
        return Reconstruction {
            signal: EcgSignal::empty(sample_rate),
            time_ranges,
        };
    }

    // Uniform resampling by linear interpolation, edge-held outside the
    // trace's own coverage.
    let mut leads: BTreeMap<Lead, Vec<f64>> = BTreeMap::new();
    for (lead, s) in &series {
        let mut samples = Vec::with_capacity(n_samples);
        let mut cursor = 0usize;
        for i in 0..n_samples {
            let t = i as f64 / sample_rate;
            samples.push(sample_at(&s.times, &s.volts, t, &mut cursor));
        }
        leads.insert(*lead, samples);
    }

    // Einthoven / Goldberger synthesis of absent limb leads.
    derive_limb_leads(&mut leads, n_samples);

    Reconstruction {
        signal: EcgSignal { sample_rate, duration, leads },
        time_ranges,
    }
}

/// Linear interpolation over a sorted time series; `cursor` persists across
/// calls with increasing `t` so the scan stays O(n) per lead.
fn sample_at(times: &[f64], volts: &[f64], t: f64, cursor: &mut usize) -> f64 {
    if times.is_empty() {
        return 0.0;
    }
    if t <= times[0] {
        return volts[0];
    }
    if t >= times[times.len() - 1] {
        return volts[volts.len() - 1];
    }
    while *cursor + 1 < times.len() && times[*cursor + 1] < t {
        *cursor += 1;
    }
    let (t0, t1) = (times[*cursor], times[*cursor + 1]);
    let (v0, v1) = (volts[*cursor], volts[*cursor + 1]);
    if t1 <= t0 {
        return v0;
    }
    v0 + (v1 - v0) * (t - t0) / (t1 - t0)
}

/// Fill in III, aVR, aVL, aVF from I and II where absent — and only where
/// absent; a traced lead always beats a derived one.
fn derive_limb_leads(leads: &mut BTreeMap<Lead, Vec<f64>>, n: usize) {
    let (Some(lead_i), Some(lead_ii)) = (leads.get(&Lead::I).cloned(), leads.get(&Lead::II).cloned())
    else {
        return;
    };
    if lead_i.len() != n || lead_ii.len() != n {
        return;
    }

    let derive = |f: &dyn Fn(f64, f64) -> f64| -> Vec<f64> {
        lead_i.iter().zip(lead_ii.iter()).map(|(&a, &b)| f(a, b)).collect()
    };
    if !leads.contains_key(&Lead::III) {
        leads.insert(Lead::III, derive(&|i, ii| ii - i));
    }
    if !leads.contains_key(&Lead::AVR) {
        leads.insert(Lead::AVR, derive(&|i, ii| -(i + ii) / 2.0));
    }
    if !leads.contains_key(&Lead::AVL) {
        leads.insert(Lead::AVL, derive(&|i, ii| i - ii / 2.0));
    }
    if !leads.contains_key(&Lead::AVF) {
        leads.insert(Lead::AVF, derive(&|i, ii| ii - i / 2.0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationSource;
    use crate::geom::Bounds;

    fn cal_10px_mm() -> Calibration {
        Calibration {
            gain_mm_per_mv: 10.0,
            paper_speed_mm_per_s: 25.0,
            gain_source: CalibrationSource::StandardAssumed,
            speed_source: CalibrationSource::StandardAssumed,
            px_per_mm: 10.0,
            confidence: 0.8,
        }
    }

    fn flat_trace(x0: f64, n: usize, y: f64, baseline: f64) -> RawTrace {
        RawTrace {
            xs: (0..n).map(|i| x0 + i as f64).collect(),
            ys: vec![y; n],
            confidence: vec![1.0; n],
            baseline_y: baseline,
            gaps: Vec::new(),
            bounds: Bounds::new(x0 as i32, 0, n as i32, 100),
        }
    }

    fn lead_trace(lead: Lead, col: usize, trace: RawTrace) -> LeadTrace {
        LeadTrace { lead, col, is_rhythm_strip: false, trace }
    }

    #[test]
    fn voltage_scale_follows_calibration() {
        // 10 px above baseline at 100 px/mV → +0.1 mV → 100 µV.
        let traces = vec![lead_trace(Lead::I, 0, flat_trace(0.0, 625, 40.0, 50.0))];
        let rec = reconstruct(&traces, &cal_10px_mm(), 500.0);
        let samples = &rec.signal.leads[&Lead::I];
        assert!(samples.iter().all(|&v| (v - 100.0).abs() < 1e-6));
    }

    #[test]
    fn sample_count_matches_duration_times_rate() {
        // 625 px at 250 px/s → 2.5 s → 1250 samples at 500 Hz.
        let traces = vec![lead_trace(Lead::I, 0, flat_trace(0.0, 626, 50.0, 50.0))];
        let rec = reconstruct(&traces, &cal_10px_mm(), 500.0);
        assert!((rec.signal.duration - 2.5).abs() < 0.01);
        let n = rec.signal.leads[&Lead::I].len();
        let expected = (rec.signal.duration * 500.0).round() as usize;
        assert!((n as i64 - expected as i64).abs() <= 2);
    }

    #[test]
    fn column_peers_share_a_time_origin() {
        // Lead I starts 5 px later than lead II in the same column; both
        // must still be sampled against the column origin.
        let traces = vec![
            lead_trace(Lead::I, 0, flat_trace(105.0, 300, 30.0, 50.0)),
            lead_trace(Lead::II, 0, flat_trace(100.0, 305, 20.0, 50.0)),
        ];
        let rec = reconstruct(&traces, &cal_10px_mm(), 500.0);
        let (start_i, _) = rec.time_ranges[&Lead::I];
        let (start_ii, _) = rec.time_ranges[&Lead::II];
        assert!((start_ii - 0.0).abs() < 1e-9);
        assert!((start_i - 5.0 / 250.0).abs() < 1e-9);
    }

    #[test]
    fn missing_limb_leads_are_derived_by_einthoven() {
        let traces = vec![
            lead_trace(Lead::I, 0, flat_trace(0.0, 300, 40.0, 50.0)), // +100 µV
            lead_trace(Lead::II, 0, flat_trace(0.0, 300, 20.0, 50.0)), // +300 µV
        ];
        let rec = reconstruct(&traces, &cal_10px_mm(), 500.0);
        let leads = &rec.signal.leads;
        let (i, ii) = (100.0, 300.0);
        assert!((leads[&Lead::III][5] - (ii - i)).abs() < 1e-6);
        assert!((leads[&Lead::AVR][5] - (-(i + ii) / 2.0)).abs() < 1e-6);
        assert!((leads[&Lead::AVL][5] - (i - ii / 2.0)).abs() < 1e-6);
        assert!((leads[&Lead::AVF][5] - (ii - i / 2.0)).abs() < 1e-6);
    }

    #[test]
    fn traced_leads_are_never_overwritten_by_derivation() {
        let traces = vec![
            lead_trace(Lead::I, 0, flat_trace(0.0, 300, 40.0, 50.0)),
            lead_trace(Lead::II, 0, flat_trace(0.0, 300, 20.0, 50.0)),
            // A traced III that deliberately violates Einthoven.
            lead_trace(Lead::III, 0, flat_trace(0.0, 300, 45.0, 50.0)), // 50 µV
        ];
        let rec = reconstruct(&traces, &cal_10px_mm(), 500.0);
        assert!((rec.signal.leads[&Lead::III][10] - 50.0).abs() < 1e-6);
    }

    #[test]
    fn empty_input_yields_empty_signal() {
        let rec = reconstruct(&[], &cal_10px_mm(), 500.0);
        assert!(rec.signal.leads.is_empty());
        assert_eq!(rec.signal.duration, 0.0);
    }
}
