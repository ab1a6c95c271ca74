use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::geom::Color;
use crate::lead::Lead;

// ── Defaults ──────────────────────────────────────────────────────────────

fn default_sample_rate() -> f64 { 500.0 }
fn default_ai_confidence_threshold() -> f64 { 0.7 }
fn default_true() -> bool { true }
fn default_darkness_threshold() -> f64 { 80.0 }
fn default_max_interpolate_gap() -> i32 { 10 }
fn default_min_point_confidence() -> f64 { 0.3 }
fn default_smoothing_window() -> usize { 3 }
fn default_oracle_timeout_ms() -> u64 { 60_000 }
fn default_cache_ttl_ms() -> u64 { 7 * 24 * 60 * 60 * 1000 }
fn default_cache_max_bytes() -> u64 { 64 * 1024 * 1024 }

// ── Tracer ────────────────────────────────────────────────────────────────

/// Waveform tracer knobs. All fields are optional in serialized form;
/// unknown keys are ignored rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Darkness (0–255) above which a pixel counts as waveform ink.
    #[serde(default = "default_darkness_threshold")]
    pub darkness_threshold: f64,
    /// Widest horizontal gap (px) that is bridged by linear interpolation.
    #[serde(default = "default_max_interpolate_gap")]
    pub max_interpolate_gap: i32,
    /// Column estimates below this confidence open a gap instead of a sample.
    #[serde(default = "default_min_point_confidence")]
    pub min_point_confidence: f64,
    /// When set, pixels are scored by color match against this instead of
    /// plain darkness — for tracings printed in red or blue ink.
    #[serde(default)]
    pub waveform_color: Option<Color>,
    /// Moving-average window applied after artifact rejection.
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    #[serde(default = "default_true")]
    pub reject_artifacts: bool,
}

impl Default for TracerConfig {
    fn default() -> Self {
        TracerConfig {
            darkness_threshold: default_darkness_threshold(),
            max_interpolate_gap: default_max_interpolate_gap(),
            min_point_confidence: default_min_point_confidence(),
            waveform_color: None,
            smoothing_window: default_smoothing_window(),
            reject_artifacts: true,
        }
    }
}

// ── Oracle ────────────────────────────────────────────────────────────────

/// Connection settings for the external vision-model labeling service.
/// Absent entirely → the pipeline runs rule-based only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Registry key selecting the wire dialect, e.g. "chat" or "reasoning".
    pub provider: String,
    /// Base URL of the service. `None` → the provider's default endpoint.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_oracle_timeout_ms")]
    pub timeout_ms: u64,
    /// Passed through to reasoning-dialect providers ("low"/"medium"/"high").
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

// ── Cache ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Directory for persisted oracle responses. `None` with `enabled` →
    /// in-memory caching only.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Total on-disk budget; oldest entries are evicted past this.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: false,
            dir: None,
            ttl_ms: default_cache_ttl_ms(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

// ── Top level ─────────────────────────────────────────────────────────────

/// Everything the digitizer accepts from the caller. Every field has a
/// default, so `DigitizerConfig::default()` is a working rule-based setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitizerConfig {
    /// Output sample rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub target_sample_rate: f64,
    /// Oracle analyses below this confidence are treated as failed and the
    /// rule-based detector takes over.
    #[serde(default = "default_ai_confidence_threshold")]
    pub ai_confidence_threshold: f64,
    /// Allow the rule-based path to replace a failed oracle. Disabling this
    /// makes an oracle failure fatal.
    #[serde(default = "default_true")]
    pub enable_local_fallback: bool,
    /// Leads that must carry a text label after the merge; when any is
    /// missing the oracle is retried once with a focused prompt.
    #[serde(default)]
    pub critical_leads: Vec<Lead>,
    /// Apply the completeness bonus floors in the quality score.
    #[serde(default = "default_true")]
    pub apply_confidence_floors: bool,
    #[serde(default)]
    pub oracle: Option<OracleConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tracer: TracerConfig,
}

impl Default for DigitizerConfig {
    fn default() -> Self {
        DigitizerConfig {
            target_sample_rate: default_sample_rate(),
            ai_confidence_threshold: default_ai_confidence_threshold(),
            enable_local_fallback: true,
            critical_leads: Vec::new(),
            apply_confidence_floors: true,
            oracle: None,
            cache: CacheConfig::default(),
            tracer: TracerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_full_defaults() {
        let cfg: DigitizerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.target_sample_rate, 500.0);
        assert_eq!(cfg.ai_confidence_threshold, 0.7);
        assert!(cfg.enable_local_fallback);
        assert!(cfg.oracle.is_none());
        assert_eq!(cfg.tracer.darkness_threshold, 80.0);
        assert_eq!(cfg.tracer.smoothing_window, 3);
        assert_eq!(cfg.cache.ttl_ms, 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: DigitizerConfig =
            serde_json::from_str(r#"{"target_sample_rate": 250, "not_a_real_option": 1}"#).unwrap();
        assert_eq!(cfg.target_sample_rate, 250.0);
    }

    #[test]
    fn critical_leads_parse_from_names() {
        let cfg: DigitizerConfig =
            serde_json::from_str(r#"{"critical_leads": ["I", "II", "aVF"]}"#).unwrap();
        assert_eq!(cfg.critical_leads, vec![Lead::I, Lead::II, Lead::AVF]);
    }
}
