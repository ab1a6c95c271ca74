use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::calibration::Calibration;
use crate::grid::GridInfo;
use crate::lead::Lead;
use crate::panel::Panel;
use crate::signal::EcgSignal;

// ── Issues ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    LowLeadConfidence,
    MissingLeads,
    FlatLine,
    PossibleSaturation,
    ExcessiveNoise,
    OracleUnavailable,
    CalibrationPulseRejected,
    InvertedDisplay,
    Fatal,
}

/// One diagnostic finding surfaced to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub leads: Vec<Lead>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Issue {
    pub fn new(code: IssueCode, severity: Severity, message: impl Into<String>) -> Self {
        Issue { code, severity, message: message.into(), leads: Vec::new(), suggestion: None }
    }

    pub fn with_leads(mut self, leads: Vec<Lead>) -> Self {
        self.leads = leads;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

// ── Stage log ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Failed,
    Skipped,
}

/// One pipeline stage's observable record, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLog {
    pub name: String,
    pub status: StageStatus,
    pub confidence: f64,
    pub duration_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

// ── Outcome ───────────────────────────────────────────────────────────────

/// Which path produced the panel geometry and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigitizeMethod {
    OracleGuided,
    RuleBased,
    Hybrid,
}

/// Everything the digitizer returns to the caller. Ownership transfers
/// wholesale; nothing inside refers back to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitizeOutcome {
    pub success: bool,
    pub signal: Option<EcgSignal>,
    pub confidence: f64,
    pub lead_confidence: BTreeMap<Lead, f64>,
    pub stages: Vec<StageLog>,
    pub issues: Vec<Issue>,
    pub suggestions: Vec<String>,
    pub method: DigitizeMethod,
    pub grid: GridInfo,
    pub calibration: Option<Calibration>,
    pub panels: Vec<Panel>,
    pub processing_ms: f64,
}

impl DigitizeOutcome {
    /// Collect the distinct suggestions carried by issues, preserving order.
    pub(crate) fn collect_suggestions(&mut self) {
        for issue in &self.issues {
            if let Some(s) = &issue.suggestion {
                if !self.suggestions.iter().any(|existing| existing == s) {
                    self.suggestions.push(s.clone());
                }
            }
        }
    }
}
