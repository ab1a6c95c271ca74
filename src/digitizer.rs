use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::baseline::detect_baseline;
use crate::calibration::{detect_pulse, resolve_calibration, Calibration, CalibrationSource};
use crate::config::{DigitizerConfig, TracerConfig};
use crate::grid::{detect_grid, GridInfo};
use crate::image::EcgImage;
use crate::lead::Lead;
use crate::layout::analyze_layout;
use crate::merge::{merge_panels, MergeOutcome};
use crate::normalize::normalize;
use crate::oracle::{OracleAdapter, OracleAnalysis};
use crate::panel::{EcgFormat, Panel};
use crate::quality::{assess, QualityInput};
use crate::report::{
    DigitizeMethod, DigitizeOutcome, Issue, IssueCode, Severity, StageLog, StageStatus,
};
use crate::signal::{reconstruct, LeadTrace};
use crate::trace::{trace_panel, RawTrace};

// ── Constants ─────────────────────────────────────────────────────────────

/// Escalating darkness thresholds tried per panel.
const RETRY_THRESHOLDS: [f64; 5] = [80.0, 60.0, 100.0, 40.0, 120.0];

/// Bounds expansion (px per side) for the final retry round.
const RETRY_MARGIN: i32 = 10;

/// Mean point confidence at which a trace attempt short-circuits the
/// retry schedule.
const GOOD_MEAN_CONFIDENCE: f64 = 0.7;

/// Confidence assigned to samples synthesized from oracle trace points.
const ORACLE_TRACE_CONFIDENCE: f64 = 0.4;

// ── Cancellation ──────────────────────────────────────────────────────────

/// Shared cancellation flag; polled at every stage boundary.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Input ─────────────────────────────────────────────────────────────────

/// A decoded page plus the EXIF orientation its container carried.
pub struct DigitizeInput {
    pub image: EcgImage,
    pub exif_orientation: u8,
}

impl From<EcgImage> for DigitizeInput {
    fn from(image: EcgImage) -> Self {
        DigitizeInput { image, exif_orientation: 1 }
    }
}

// ── Digitizer ─────────────────────────────────────────────────────────────

/// The pipeline driver. One instance is reusable across images; per-run
/// state lives on the stack of `digitize`.
pub struct Digitizer {
    config: DigitizerConfig,
    oracle: Option<OracleAdapter>,
}

impl Digitizer {
    pub fn new(config: DigitizerConfig) -> Self {
        let oracle = config.oracle.as_ref().and_then(|oc| {
            match OracleAdapter::from_config(oc, &config.cache) {
                Ok(adapter) => Some(adapter),
                Err(e) => {
                    tracing::warn!(error = %e, "oracle disabled: bad configuration");
                    None
                }
            }
        });
        Digitizer { config, oracle }
    }

    /// Bring-your-own provider — used by callers with custom transports.
    pub fn with_adapter(config: DigitizerConfig, adapter: OracleAdapter) -> Self {
        Digitizer { config, oracle: Some(adapter) }
    }

    pub fn config(&self) -> &DigitizerConfig {
        &self.config
    }

    pub fn digitize(&self, input: impl Into<DigitizeInput>) -> DigitizeOutcome {
        self.digitize_with_cancel(input, &CancelFlag::default(), None)
    }

    /// Full pipeline with cooperative cancellation and an optional overall
    /// deadline; both are polled at stage boundaries and the deadline also
    /// caps the oracle transport timeout.
    pub fn digitize_with_cancel(
        &self,
        input: impl Into<DigitizeInput>,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
    ) -> DigitizeOutcome {
        let input = input.into();
        let run_started = Instant::now();
        let mut run = RunState::new(run_started);

        // ── loading: orientation + inversion normalization ────────────
        let stage = Instant::now();
        let (img, inversion) = normalize(input.image, input.exif_orientation);
        if inversion.inverted {
            run.issues.push(Issue::new(
                IssueCode::InvertedDisplay,
                Severity::Info,
                "white-on-black display detected and inverted",
            ));
        }
        run.log(
            "loading",
            StageStatus::Success,
            1.0,
            stage,
            inversion.inverted.then(|| "inverted colors corrected".to_string()),
        );
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── grid geometry ─────────────────────────────────────────────
        let stage = Instant::now();
        let grid = detect_grid(&img);
        run.log(
            "grid_detection",
            if grid.detected { StageStatus::Success } else { StageStatus::Failed },
            grid.confidence,
            stage,
            None,
        );
        run.grid = Some(grid.clone());
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── oracle analysis ───────────────────────────────────────────
        let mut oracle_analysis: Option<OracleAnalysis> = None;
        match &self.oracle {
            Some(adapter) => {
                let stage = Instant::now();
                match adapter.analyze(&img, &self.config.critical_leads, deadline) {
                    Ok(outcome) if outcome.confidence >= self.config.ai_confidence_threshold => {
                        run.log(
                            "oracle_analysis",
                            StageStatus::Success,
                            outcome.confidence,
                            stage,
                            outcome.from_cache.then(|| "cache hit".to_string()),
                        );
                        oracle_analysis = Some(outcome.analysis);
                    }
                    Ok(outcome) => {
                        run.log(
                            "oracle_analysis",
                            StageStatus::Failed,
                            outcome.confidence,
                            stage,
                            Some(format!(
                                "confidence {:.2} below threshold {:.2}",
                                outcome.confidence, self.config.ai_confidence_threshold
                            )),
                        );
                    }
                    Err(e) => {
                        run.log(
                            "oracle_analysis",
                            StageStatus::Failed,
                            0.0,
                            stage,
                            Some(e.to_string()),
                        );
                        run.issues.push(Issue::new(
                            IssueCode::OracleUnavailable,
                            Severity::Warning,
                            format!("layout oracle unavailable: {e}"),
                        ));
                    }
                }
            }
            None => run.log("oracle_analysis", StageStatus::Skipped, 0.0, Instant::now(), None),
        }
        if oracle_analysis.is_none() && !self.config.enable_local_fallback && self.oracle.is_some()
        {
            return run.fatal(&img, "oracle failed and local fallback is disabled");
        }
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── rule-based layout ─────────────────────────────────────────
        let stage = Instant::now();
        let layout = analyze_layout(&img);
        run.log(
            "local_cv",
            if layout.panels.is_empty() { StageStatus::Failed } else { StageStatus::Success },
            layout.confidence,
            stage,
            Some(format!("{} regions, format {:?}", layout.panels.len(), layout.format)),
        );

        // Prefer the oracle's grid shape for format when rules were unsure.
        let format = if layout.format == EcgFormat::Unknown {
            oracle_analysis
                .as_ref()
                .and_then(|a| Some(EcgFormat::classify(a.rows?, a.cols?, a.panels.len())))
                .unwrap_or(layout.format)
        } else {
            layout.format
        };

        // ── hybrid merge ──────────────────────────────────────────────
        let stage = Instant::now();
        let mut merge = merge_panels(
            &layout.panels,
            oracle_analysis.as_ref(),
            format,
            layout.confidence,
            img.width(),
            img.height(),
        );

        // Critical-leads retry: one focused second pass when configured
        // leads ended up without a text label.
        if let Some(adapter) = &self.oracle {
            let missing = self.missing_critical_labels(&merge);
            if !missing.is_empty() && oracle_analysis.is_some() {
                tracing::debug!(?missing, "retrying oracle for critical leads");
                if let Ok(outcome) = adapter.analyze(&img, &missing, deadline) {
                    let retry = merge_panels(
                        &layout.panels,
                        Some(&outcome.analysis),
                        format,
                        layout.confidence,
                        img.width(),
                        img.height(),
                    );
                    if retry.text_labels > merge.text_labels {
                        merge = retry;
                    }
                }
            }
        }

        let merged_note = format!(
            "{} panels ({} text-labeled, {} position-inferred)",
            merge.panels.len(),
            merge.text_labels,
            merge.inferred_labels
        );
        if merge.panels.is_empty() {
            run.log("hybrid_merge", StageStatus::Failed, 0.0, stage, Some(merged_note));
            return run.fatal(&img, "no waveform panels detected");
        }
        run.log("hybrid_merge", StageStatus::Success, layout.confidence, stage, Some(merged_note));
        run.method = if merge.used_oracle_geometry {
            DigitizeMethod::OracleGuided
        } else if merge.text_labels > 0 {
            DigitizeMethod::Hybrid
        } else {
            DigitizeMethod::RuleBased
        };
        let mut panels = merge.panels.clone();
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── calibration ───────────────────────────────────────────────
        let stage = Instant::now();
        let pulse = detect_pulse(&img);
        let (mut calibration, pulse_rejected) =
            resolve_calibration(&img, &grid, &panels, pulse.as_ref());
        if pulse_rejected {
            run.issues.push(Issue::new(
                IssueCode::CalibrationPulseRejected,
                Severity::Warning,
                "reference pulse contradicts panel geometry; using panel-based scale",
            ));
        }
        self.apply_oracle_calibration(&mut calibration, oracle_analysis.as_ref());
        run.log(
            "calibration",
            StageStatus::Success,
            calibration.confidence,
            stage,
            Some(format!(
                "{:.2} px/mm, gain {:.1} mm/mV ({:?})",
                calibration.px_per_mm, calibration.gain_mm_per_mv, calibration.gain_source
            )),
        );
        run.calibration = Some(calibration.clone());
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── waveform extraction ───────────────────────────────────────
        let stage = Instant::now();

        // Chromatic ink (red/blue thermal traces) switches the tracer to
        // color-match scoring against the detected family.
        let mut tracer_cfg = self.config.tracer.clone();
        if tracer_cfg.waveform_color.is_none() {
            if let Some(&ink) = layout.waveform_colors.first() {
                if ink.saturation() > 0.25 {
                    tracer_cfg.waveform_color = Some(ink);
                }
            }
        }

        for panel in panels.iter_mut() {
            let estimate = detect_baseline(
                &img,
                panel.bounds,
                merge.oracle_baselines.get(&panel.id).copied(),
                &tracer_cfg,
            );
            panel.baseline_y = estimate.y;
        }

        let traced: Vec<(usize, RawTrace)> = panels
            .par_iter()
            .filter(|p| p.lead.is_some())
            .filter_map(|panel| {
                let trace = self
                    .robust_trace(&img, panel, &tracer_cfg)
                    .or_else(|| oracle_fallback_trace(panel, &merge))?;
                Some((panel.id, trace))
            })
            .collect();

        // One trace per lead: the densest, most confident extraction wins.
        let mut by_lead: BTreeMap<Lead, (usize, RawTrace)> = BTreeMap::new();
        for (panel_id, trace) in traced {
            let lead = panels[panel_id].lead.expect("traced panels carry leads");
            let better = by_lead
                .get(&lead)
                .map_or(true, |(_, existing)| trace.quality_score() > existing.quality_score());
            if better {
                by_lead.insert(lead, (panel_id, trace));
            }
        }
        if by_lead.is_empty() {
            run.log("waveform_extraction", StageStatus::Failed, 0.0, stage, None);
            run.panels = panels;
            return run.fatal(&img, "no waveforms could be traced");
        }
        let mean_trace_conf = by_lead
            .values()
            .map(|(_, t)| t.mean_confidence())
            .sum::<f64>()
            / by_lead.len() as f64;
        run.log(
            "waveform_extraction",
            StageStatus::Success,
            mean_trace_conf,
            stage,
            Some(format!("{} leads traced", by_lead.len())),
        );
        if let Some(out) = run.check_interrupted(cancel, deadline, &img) {
            return out;
        }

        // ── reconstruction ────────────────────────────────────────────
        let stage = Instant::now();
        let lead_traces: Vec<LeadTrace> = by_lead
            .iter()
            .map(|(&lead, (panel_id, trace))| LeadTrace {
                lead,
                col: panels[*panel_id].col,
                is_rhythm_strip: panels[*panel_id].is_rhythm_strip,
                trace: trace.clone(),
            })
            .collect();
        let reconstruction =
            reconstruct(&lead_traces, &calibration, self.config.target_sample_rate);
        for panel in panels.iter_mut() {
            if let Some(lead) = panel.lead {
                panel.time_range = reconstruction.time_ranges.get(&lead).copied();
            }
        }
        run.log(
            "reconstruction",
            StageStatus::Success,
            1.0,
            stage,
            Some(format!(
                "{} leads, {:.2} s at {} Hz",
                reconstruction.signal.leads.len(),
                reconstruction.signal.duration,
                self.config.target_sample_rate
            )),
        );

        // ── quality assessment ────────────────────────────────────────
        let stage = Instant::now();
        let panel_info: BTreeMap<Lead, (f64, f64)> = by_lead
            .iter()
            .map(|(&lead, (panel_id, _))| {
                let p = &panels[*panel_id];
                (lead, (p.bounds.width as f64, p.label_confidence))
            })
            .collect();
        let quality = assess(&QualityInput {
            traces: &lead_traces,
            panel_info: &panel_info,
            signal: &reconstruction.signal,
            format,
            calibration_confidence: calibration.confidence,
            grid_confidence: grid.confidence,
            image_quality: oracle_analysis.as_ref().and_then(|a| a.image_quality),
            apply_confidence_floors: self.config.apply_confidence_floors,
        });
        run.issues.extend(quality.issues);
        run.log("quality_assessment", StageStatus::Success, quality.overall, stage, None);

        // ── assemble ──────────────────────────────────────────────────
        let mut outcome = DigitizeOutcome {
            success: true,
            signal: Some(reconstruction.signal),
            confidence: quality.overall,
            lead_confidence: quality.per_lead,
            stages: run.stages,
            issues: run.issues,
            suggestions: Vec::new(),
            method: run.method,
            grid,
            calibration: Some(calibration),
            panels,
            processing_ms: run_started.elapsed().as_secs_f64() * 1000.0,
        };
        outcome.collect_suggestions();
        outcome
    }

    // ── helpers ───────────────────────────────────────────────────────

    fn missing_critical_labels(&self, merge: &MergeOutcome) -> Vec<Lead> {
        self.config
            .critical_leads
            .iter()
            .copied()
            .filter(|lead| {
                !merge.panels.iter().any(|p| {
                    p.lead == Some(*lead)
                        && p.lead_source == crate::panel::LeadSource::TextLabel
                })
            })
            .collect()
    }

    /// Oracle-read calibration text fills in whatever the pulse and grid
    /// could not establish.
    fn apply_oracle_calibration(
        &self,
        calibration: &mut Calibration,
        oracle: Option<&OracleAnalysis>,
    ) {
        let Some(analysis) = oracle else { return };
        if calibration.gain_source == CalibrationSource::StandardAssumed {
            if let Some(gain) = analysis.gain {
                if (1.0..=40.0).contains(&gain) {
                    calibration.gain_mm_per_mv = gain;
                    calibration.gain_source = CalibrationSource::TextLabel;
                }
            }
        }
        if calibration.speed_source == CalibrationSource::StandardAssumed {
            if let Some(speed) = analysis.paper_speed {
                if (5.0..=100.0).contains(&speed) {
                    calibration.paper_speed_mm_per_s = speed;
                    calibration.speed_source = CalibrationSource::TextLabel;
                }
            }
        }
    }

    /// Escalating trace attempts: the configured threshold first, then the
    /// retry schedule; a confident attempt short-circuits. If nothing
    /// clears the bar, try once more with expanded bounds and keep the
    /// best-scoring usable trace.
    fn robust_trace(
        &self,
        img: &EcgImage,
        panel: &Panel,
        base: &TracerConfig,
    ) -> Option<RawTrace> {
        let mut thresholds: Vec<f64> = vec![base.darkness_threshold];
        thresholds.extend(RETRY_THRESHOLDS.iter().filter(|&&t| t != base.darkness_threshold));

        let mut best: Option<RawTrace> = None;
        for margin in [0, RETRY_MARGIN] {
            let bounds = panel.bounds.expanded(margin);
            for &threshold in &thresholds {
                let cfg = TracerConfig { darkness_threshold: threshold, ..base.clone() };
                let trace = trace_panel(img, bounds, panel.baseline_y, &cfg);
                if !trace.usable() {
                    continue;
                }
                if trace.mean_confidence() >= GOOD_MEAN_CONFIDENCE {
                    return Some(trace);
                }
                if best.as_ref().map_or(true, |b| trace.quality_score() > b.quality_score()) {
                    best = Some(trace);
                }
            }
        }
        best
    }
}

/// Synthesize a trace from the oracle's sparse trace points when pixel
/// tracing produced nothing for this panel.
fn oracle_fallback_trace(panel: &Panel, merge: &MergeOutcome) -> Option<RawTrace> {
    let points = merge.oracle_traces.get(&panel.id)?;
    let mut pts: Vec<(f64, f64)> = points
        .iter()
        .map(|&(frac, y)| (panel.bounds.x as f64 + frac * panel.bounds.width as f64, y))
        .collect();
    pts.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    pts.dedup_by(|a, b| (a.0 - b.0).abs() < 1.0);
    if pts.len() < crate::trace::MIN_TRACE_POINTS {
        return None;
    }
    let top = panel.bounds.y as f64;
    let bottom = panel.bounds.bottom() as f64;
    Some(RawTrace {
        xs: pts.iter().map(|p| p.0).collect(),
        ys: pts.iter().map(|p| p.1.clamp(top, bottom)).collect(),
        confidence: vec![ORACLE_TRACE_CONFIDENCE; pts.len()],
        baseline_y: panel.baseline_y,
        gaps: Vec::new(),
        bounds: panel.bounds,
    })
}

// ── Run state ─────────────────────────────────────────────────────────────

/// Mutable per-run bookkeeping shared by the stage blocks above.
struct RunState {
    started: Instant,
    stages: Vec<StageLog>,
    issues: Vec<Issue>,
    method: DigitizeMethod,
    grid: Option<GridInfo>,
    calibration: Option<Calibration>,
    panels: Vec<Panel>,
}

impl RunState {
    fn new(started: Instant) -> Self {
        RunState {
            started,
            stages: Vec::new(),
            issues: Vec::new(),
            method: DigitizeMethod::RuleBased,
            grid: None,
            calibration: None,
            panels: Vec::new(),
        }
    }

    fn log(
        &mut self,
        name: &str,
        status: StageStatus,
        confidence: f64,
        stage_started: Instant,
        note: Option<String>,
    ) {
        tracing::debug!(stage = name, ?status, confidence, "stage complete");
        self.stages.push(StageLog {
            name: name.to_string(),
            status,
            confidence,
            duration_ms: stage_started.elapsed().as_secs_f64() * 1000.0,
            note,
        });
    }

    /// Failure outcome carrying whatever was established so far.
    fn fatal(mut self, img: &EcgImage, message: &str) -> DigitizeOutcome {
        self.issues.push(
            Issue::new(IssueCode::Fatal, Severity::Error, message)
                .with_suggestion("Provide a higher resolution or less degraded image"),
        );
        let grid = self
            .grid
            .take()
            .unwrap_or_else(|| GridInfo::undetected(crate::grid::corner_background(img)));
        let mut outcome = DigitizeOutcome {
            success: false,
            signal: None,
            confidence: 0.0,
            lead_confidence: BTreeMap::new(),
            stages: self.stages,
            issues: self.issues,
            suggestions: Vec::new(),
            method: self.method,
            grid,
            calibration: self.calibration,
            panels: self.panels,
            processing_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        };
        outcome.collect_suggestions();
        outcome
    }

    /// Cancellation / deadline poll between stages.
    fn check_interrupted(
        &mut self,
        cancel: &CancelFlag,
        deadline: Option<Instant>,
        img: &EcgImage,
    ) -> Option<DigitizeOutcome> {
        let timed_out = deadline.is_some_and(|d| Instant::now() >= d);
        if !cancel.is_cancelled() && !timed_out {
            return None;
        }
        let message =
            if timed_out { "digitization deadline exceeded" } else { "digitization cancelled" };
        let started = self.started;
        let state = std::mem::replace(self, RunState::new(started));
        Some(state.fatal(img, message))
    }
}
