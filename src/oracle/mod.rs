pub mod cache;
pub mod provider;

use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::{CacheConfig, OracleConfig};
use crate::error::DigitizeError;
use crate::geom::Bounds;
use crate::image::EcgImage;
use crate::lead::Lead;

use cache::OracleCache;
use provider::{build_provider, OracleProvider};

/// Upper bound on the panels array accepted from the oracle; anything past
/// it is hallucination, not layout.
const MAX_ORACLE_PANELS: usize = 32;

/// Trace points kept per panel (the prompt asks for 41).
const MAX_TRACE_POINTS: usize = 64;

const MAX_CRITICAL_POINTS: usize = 32;

// ── Failure ───────────────────────────────────────────────────────────────

/// Soft failures of the oracle stage. None of these abort the pipeline;
/// the orchestrator logs the stage as failed and proceeds rule-based.
#[derive(Debug, Error)]
pub enum OracleFailure {
    #[error("transport: {0}")]
    Transport(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("deadline exceeded")]
    Timeout,
    #[error("unparseable response: {0}")]
    Malformed(String),
}

// ── Wire types ────────────────────────────────────────────────────────────
//
// The response is untrusted input: every numeric field accepts a number or
// a numeric string, every enum-ish field arrives as free text, and missing
// fields default rather than fail.

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NumOrText {
    Num(f64),
    Text(String),
}

fn flex_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    let v = Option::<NumOrText>::deserialize(d)?;
    Ok(v.and_then(|v| match v {
        NumOrText::Num(n) if n.is_finite() => Some(n),
        NumOrText::Num(_) => None,
        NumOrText::Text(s) => s.trim().parse::<f64>().ok(),
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawGrid {
    #[serde(deserialize_with = "flex_f64")]
    pub px_per_mm: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub small_box_px: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawLayout {
    #[serde(deserialize_with = "flex_f64")]
    pub rows: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub columns: Option<f64>,
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawCalibration {
    #[serde(deserialize_with = "flex_f64")]
    pub gain: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub paper_speed: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawBounds {
    #[serde(deserialize_with = "flex_f64")]
    pub x: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub y: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub width: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub height: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawTracePoint {
    #[serde(deserialize_with = "flex_f64")]
    pub x_percent: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub y_pixel: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawCriticalPoint {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(deserialize_with = "flex_f64")]
    pub x_percent: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub y_pixel: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawPanel {
    pub lead: Option<String>,
    pub bounds: Option<RawBounds>,
    #[serde(deserialize_with = "flex_f64")]
    pub baseline_y: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub row: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub col: Option<f64>,
    pub is_rhythm_strip: Option<bool>,
    #[serde(deserialize_with = "flex_f64")]
    pub confidence: Option<f64>,
    pub trace_points: Vec<RawTracePoint>,
    pub critical_points: Vec<RawCriticalPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawAnalysis {
    pub grid: Option<RawGrid>,
    pub layout: Option<RawLayout>,
    pub calibration: Option<RawCalibration>,
    pub panels: Vec<RawPanel>,
    #[serde(deserialize_with = "flex_f64")]
    pub image_quality: Option<f64>,
    #[serde(deserialize_with = "flex_f64")]
    pub confidence: Option<f64>,
    pub notes: Option<String>,
}

// ── Normalized analysis ───────────────────────────────────────────────────

/// Morphology landmark kinds the oracle may flag. Unrecognized labels map
/// to `Unknown` rather than failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CriticalKind {
    RPeak,
    STrough,
    PWave,
    TWave,
    Unknown,
}

impl CriticalKind {
    fn parse(text: &str) -> CriticalKind {
        match text.trim().to_ascii_uppercase().as_str() {
            "R" | "R_PEAK" | "RPEAK" => CriticalKind::RPeak,
            "S" | "S_TROUGH" | "STROUGH" => CriticalKind::STrough,
            "P" | "P_WAVE" | "PWAVE" => CriticalKind::PWave,
            "T" | "T_WAVE" | "TWAVE" => CriticalKind::TWave,
            _ => CriticalKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticalPoint {
    pub kind: CriticalKind,
    /// Horizontal position as a fraction of the panel width, 0.0–1.0.
    pub x_fraction: f64,
    pub y_pixel: f64,
}

/// One oracle-described panel after validation and clamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledPanel {
    pub lead: Option<Lead>,
    pub bounds: Option<Bounds>,
    pub baseline_y: Option<f64>,
    /// Grid cell the oracle claims, when it reported one.
    pub row: Option<usize>,
    pub col: Option<usize>,
    pub is_rhythm_strip: bool,
    pub confidence: f64,
    /// Sparse relative trace: (x fraction of panel width, y pixel).
    pub trace: Vec<(f64, f64)>,
    pub critical_points: Vec<CriticalPoint>,
}

/// The oracle's layout hint after defensive normalization: confidences
/// clamped to [0,1], lead names re-cased, bounds validated, arrays bounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OracleAnalysis {
    pub panels: Vec<LabeledPanel>,
    pub px_per_mm: Option<f64>,
    pub gain: Option<f64>,
    pub paper_speed: Option<f64>,
    pub rows: Option<usize>,
    pub cols: Option<usize>,
    pub image_quality: Option<f64>,
    pub confidence: f64,
    pub notes: Option<String>,
}

pub fn normalize_analysis(raw: RawAnalysis) -> OracleAnalysis {
    let mut panels: Vec<LabeledPanel> = Vec::new();
    for p in raw.panels.into_iter().take(MAX_ORACLE_PANELS) {
        let bounds = p.bounds.as_ref().and_then(|b| {
            let (x, y) = (b.x?, b.y?);
            let (w, h) = (b.width?, b.height?);
            (w > 0.0 && h > 0.0).then(|| {
                Bounds::new(x.round() as i32, y.round() as i32, w.round() as i32, h.round() as i32)
            })
        });
        let trace: Vec<(f64, f64)> = p
            .trace_points
            .into_iter()
            .take(MAX_TRACE_POINTS)
            .filter_map(|tp| {
                let x = tp.x_percent?;
                let y = tp.y_pixel?;
                (0.0..=100.0).contains(&x).then_some((x / 100.0, y))
            })
            .collect();
        let critical_points: Vec<CriticalPoint> = p
            .critical_points
            .into_iter()
            .take(MAX_CRITICAL_POINTS)
            .filter_map(|cp| {
                let x = cp.x_percent?;
                let y = cp.y_pixel?;
                (0.0..=100.0).contains(&x).then(|| CriticalPoint {
                    kind: cp.kind.as_deref().map_or(CriticalKind::Unknown, CriticalKind::parse),
                    x_fraction: x / 100.0,
                    y_pixel: y,
                })
            })
            .collect();
        panels.push(LabeledPanel {
            lead: p.lead.as_deref().and_then(Lead::parse),
            bounds,
            baseline_y: p.baseline_y,
            row: p.row.filter(|&r| r >= 0.0).map(|r| r as usize),
            col: p.col.filter(|&c| c >= 0.0).map(|c| c as usize),
            is_rhythm_strip: p.is_rhythm_strip.unwrap_or(false),
            confidence: p.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            trace,
            critical_points,
        });
    }

    let mean_panel_conf = if panels.is_empty() {
        0.0
    } else {
        panels.iter().map(|p| p.confidence).sum::<f64>() / panels.len() as f64
    };
    let confidence = raw.confidence.unwrap_or(mean_panel_conf).clamp(0.0, 1.0);

    OracleAnalysis {
        panels,
        px_per_mm: raw
            .grid
            .as_ref()
            .and_then(|g| g.px_per_mm.or(g.small_box_px))
            .filter(|&v| v > 0.0),
        gain: raw.calibration.as_ref().and_then(|c| c.gain).filter(|&v| v > 0.0),
        paper_speed: raw.calibration.as_ref().and_then(|c| c.paper_speed).filter(|&v| v > 0.0),
        rows: raw.layout.as_ref().and_then(|l| l.rows).map(|r| r.max(0.0) as usize),
        cols: raw.layout.as_ref().and_then(|l| l.columns).map(|c| c.max(0.0) as usize),
        image_quality: raw.image_quality.map(|q| q.clamp(0.0, 1.0)),
        confidence,
        notes: raw.notes,
    }
}

// ── JSON repair ───────────────────────────────────────────────────────────

/// Best-effort repair of a model reply into parseable JSON: strip markdown
/// fences, trim to the outermost object, drop trailing commas, and close
/// any unbalanced braces/brackets. Failure after repair is a soft failure.
pub fn repair_json(raw: &str) -> String {
    let mut text = raw.trim();

    // Markdown fences, with or without a language tag.
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        text = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
    }

    // Outermost object.
    let text = match text.find('{') {
        Some(open) => match text.rfind('}') {
            Some(close) if close > open => &text[open..=close],
            _ => &text[open..],
        },
        None => text,
    };

    // Single pass: remove trailing commas outside strings, track nesting.
    let mut out = String::with_capacity(text.len() + 8);
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for ch in text.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '{' => {
                stack.push('}');
                out.push(ch);
            }
            '[' => {
                stack.push(']');
                out.push(ch);
            }
            '}' | ']' => {
                drop_trailing_comma(&mut out);
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    // Unterminated string, then any unclosed scopes.
    if in_string {
        out.push('"');
    }
    drop_trailing_comma(&mut out);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn drop_trailing_comma(out: &mut String) {
    let trimmed = out.trim_end();
    if trimmed.ends_with(',') {
        let keep = trimmed.len() - 1;
        out.truncate(keep);
    }
}

// ── Prompt ────────────────────────────────────────────────────────────────

/// Instruction sent with every image. Asks for the exact JSON shape the
/// wire types parse, plus a 41-point relative trace per panel.
pub fn analysis_prompt(critical_leads: &[Lead]) -> String {
    let mut prompt = String::from(
        "You are analyzing a 12-lead ECG image. Reply with ONLY a JSON object, no prose, \
         shaped as: {\"grid\": {\"pxPerMm\": number, \"smallBoxPx\": number}, \
         \"layout\": {\"rows\": number, \"columns\": number, \"format\": string}, \
         \"calibration\": {\"gain\": number, \"paperSpeed\": number}, \
         \"panels\": [{\"lead\": string, \"bounds\": {\"x\": number, \"y\": number, \
         \"width\": number, \"height\": number}, \"baselineY\": number, \"row\": number, \
         \"col\": number, \"isRhythmStrip\": boolean, \"confidence\": number, \
         \"tracePoints\": [{\"xPercent\": number, \"yPixel\": number}], \
         \"criticalPoints\": [{\"type\": \"R\"|\"S\"|\"P\"|\"T\", \"xPercent\": number, \
         \"yPixel\": number}]}], \"imageQuality\": number, \"notes\": string}. \
         Give every panel's pixel bounds and isoelectric baselineY. For tracePoints, \
         sample the waveform at 41 evenly spaced x positions (xPercent 0 to 100) and \
         report the waveform's y pixel at each. Mark R peaks, S troughs, and P/T waves \
         in criticalPoints. Confidences are 0 to 1.",
    );
    if !critical_leads.is_empty() {
        let names: Vec<&str> = critical_leads.iter().map(|l| l.name()).collect();
        prompt.push_str(&format!(
            " It is essential that the panels for leads {} are located and labeled.",
            names.join(", ")
        ));
    }
    prompt
}

// ── Adapter ───────────────────────────────────────────────────────────────

/// What the oracle stage hands the orchestrator.
#[derive(Debug, Clone)]
pub struct OracleOutcome {
    pub analysis: OracleAnalysis,
    pub confidence: f64,
    pub duration: Duration,
    pub from_cache: bool,
}

/// Adapter over one provider: encodes the image, bounds the call with a
/// deadline, repairs and normalizes the reply, and consults the cache.
pub struct OracleAdapter {
    provider: Box<dyn OracleProvider>,
    cache: Option<OracleCache>,
    timeout: Duration,
}

impl OracleAdapter {
    pub fn from_config(
        oracle: &OracleConfig,
        cache: &CacheConfig,
    ) -> Result<Self, DigitizeError> {
        Ok(OracleAdapter {
            provider: build_provider(oracle)?,
            cache: cache.enabled.then(|| OracleCache::new(cache.clone())),
            timeout: Duration::from_millis(oracle.timeout_ms),
        })
    }

    /// Wrap a custom transport directly, bypassing the registry. No cache.
    pub fn with_provider(provider: Box<dyn OracleProvider>) -> Self {
        OracleAdapter { provider, cache: None, timeout: Duration::from_secs(60) }
    }

    /// One oracle round trip. `deadline` (when set) caps the transport
    /// timeout so the overall digitization budget is honored.
    pub fn analyze(
        &self,
        img: &EcgImage,
        critical_leads: &[Lead],
        deadline: Option<Instant>,
    ) -> Result<OracleOutcome, OracleFailure> {
        let started = Instant::now();
        let prompt = analysis_prompt(critical_leads);
        let ihash = cache::image_hash(img);
        let phash = cache::prompt_hash(&prompt);
        let key = format!("{ihash}_{phash}");

        // Serialize concurrent calls for the same key; the second caller
        // finds the first one's result in the cache.
        let key_lock = self.cache.as_ref().map(|c| c.key_lock(&key));
        let _guard = key_lock.as_ref().map(|l| l.lock().unwrap());

        if let Some(cache) = &self.cache {
            if let Some(value) = cache.get(&key) {
                if let Ok(raw) = serde_json::from_value::<RawAnalysis>(value) {
                    let analysis = normalize_analysis(raw);
                    tracing::debug!(key, "oracle cache hit");
                    return Ok(OracleOutcome {
                        confidence: analysis.confidence,
                        analysis,
                        duration: started.elapsed(),
                        from_cache: true,
                    });
                }
            }
        }

        let mut timeout = self.timeout;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(OracleFailure::Timeout);
            }
            timeout = timeout.min(remaining);
        }

        let reply = self.provider.request(&img.encode_png_base64(), &prompt, timeout)?;
        let repaired = repair_json(&reply);
        let value: serde_json::Value = serde_json::from_str(&repaired)
            .map_err(|e| OracleFailure::Malformed(format!("after repair: {e}")))?;
        let raw: RawAnalysis = serde_json::from_value(value.clone())
            .map_err(|e| OracleFailure::Malformed(e.to_string()))?;

        if let Some(cache) = &self.cache {
            cache.put(&ihash, &phash, value);
        }

        let analysis = normalize_analysis(raw);
        tracing::debug!(
            panels = analysis.panels.len(),
            confidence = analysis.confidence,
            provider = self.provider.name(),
            "oracle analysis"
        );
        Ok(OracleOutcome {
            confidence: analysis.confidence,
            analysis,
            duration: started.elapsed(),
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repair_strips_fences_and_trailing_commas() {
        let raw = "```json\n{\"panels\": [{\"lead\": \"II\",},],}\n```";
        let fixed = repair_json(raw);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["panels"][0]["lead"], "II");
    }

    #[test]
    fn repair_balances_unclosed_scopes() {
        let raw = "{\"grid\": {\"pxPerMm\": 10, \"panels\": [{\"lead\": \"V1\"";
        let fixed = repair_json(raw);
        assert!(serde_json::from_str::<serde_json::Value>(&fixed).is_ok(), "got: {fixed}");
    }

    #[test]
    fn repair_trims_surrounding_prose() {
        let raw = "Here is the analysis you asked for:\n{\"confidence\": 0.9}\nHope that helps!";
        let fixed = repair_json(raw);
        let v: serde_json::Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["confidence"], 0.9);
    }

    #[test]
    fn numbers_accept_strings_on_the_wire() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"grid": {"pxPerMm": "12.5"}, "panels": [{"lead": "avr", "confidence": "0.8"}]}"#,
        )
        .unwrap();
        let analysis = normalize_analysis(raw);
        assert_eq!(analysis.px_per_mm, Some(12.5));
        assert_eq!(analysis.panels[0].lead, Some(Lead::AVR));
        assert!((analysis.panels[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn confidences_are_clamped_and_unknown_kinds_mapped() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"confidence": 3.5, "panels": [{"lead": "II",
                "criticalPoints": [{"type": "QRS-ONSET", "xPercent": 10, "yPixel": 55}]}]}"#,
        )
        .unwrap();
        let analysis = normalize_analysis(raw);
        assert_eq!(analysis.confidence, 1.0);
        assert_eq!(analysis.panels[0].critical_points[0].kind, CriticalKind::Unknown);
    }

    #[test]
    fn degenerate_bounds_are_discarded() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"panels": [{"lead": "II", "bounds": {"x": 5, "y": 5, "width": 0, "height": 40}}]}"#,
        )
        .unwrap();
        let analysis = normalize_analysis(raw);
        assert_eq!(analysis.panels[0].bounds, None);
    }

    #[test]
    fn trace_points_outside_percent_range_are_dropped() {
        let raw: RawAnalysis = serde_json::from_str(
            r#"{"panels": [{"lead": "I", "tracePoints": [
                {"xPercent": 50, "yPixel": 100},
                {"xPercent": 180, "yPixel": 90}]}]}"#,
        )
        .unwrap();
        let analysis = normalize_analysis(raw);
        assert_eq!(analysis.panels[0].trace, vec![(0.5, 100.0)]);
    }

    #[test]
    fn prompt_names_critical_leads() {
        let prompt = analysis_prompt(&[Lead::I, Lead::II]);
        assert!(prompt.contains("leads I, II"));
        assert!(!analysis_prompt(&[]).contains("essential"));
    }

    struct CannedProvider(&'static str);

    impl provider::OracleProvider for CannedProvider {
        fn name(&self) -> &str {
            "canned"
        }
        fn request(
            &self,
            _png_b64: &str,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<String, OracleFailure> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn adapter_repairs_and_normalizes_a_sloppy_reply() {
        let adapter = OracleAdapter::with_provider(Box::new(CannedProvider(
            "```json\n{\"layout\": {\"rows\": 3, \"columns\": 4},\n \"panels\": [\
             {\"lead\": \"AVF\", \"bounds\": {\"x\": 0, \"y\": 0, \"width\": 100, \
             \"height\": 80}, \"baselineY\": \"40\", \"confidence\": 0.9,},]\n```",
        )));
        let img = crate::image::solid_image(8, 8, crate::geom::Color::WHITE);
        let outcome = adapter.analyze(&img, &[], None).expect("analysis");
        assert!(!outcome.from_cache);
        assert_eq!(outcome.analysis.rows, Some(3));
        let panel = &outcome.analysis.panels[0];
        assert_eq!(panel.lead, Some(Lead::AVF));
        assert_eq!(panel.baseline_y, Some(40.0));
        assert!((outcome.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn adapter_soft_fails_on_hopeless_replies() {
        let adapter =
            OracleAdapter::with_provider(Box::new(CannedProvider("I cannot see any image.")));
        let img = crate::image::solid_image(8, 8, crate::geom::Color::WHITE);
        assert!(matches!(
            adapter.analyze(&img, &[], None),
            Err(OracleFailure::Malformed(_))
        ));
    }
}
