use serde::{Deserialize, Serialize};

use crate::geom::Bounds;
use crate::lead::Lead;

// ── Format ────────────────────────────────────────────────────────────────

/// Printed page layout, classified from the detected (rows × cols) grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcgFormat {
    TwelveLead,
    FifteenLeadPediatric,
    SixByTwo,
    SingleStrip,
    RhythmOnly,
    Unknown,
}

impl EcgFormat {
    /// Classify from the clustered grid shape and usable region count.
    pub fn classify(rows: usize, cols: usize, region_count: usize) -> EcgFormat {
        match (rows, cols) {
            (3, 4) if region_count >= 12 => EcgFormat::TwelveLead,
            (3, 5) if region_count >= 15 => EcgFormat::FifteenLeadPediatric,
            (6, 2) => EcgFormat::SixByTwo,
            (1, _) => EcgFormat::SingleStrip,
            _ if region_count <= 3 => EcgFormat::RhythmOnly,
            _ => EcgFormat::Unknown,
        }
    }

    /// (rows, cols) of the main panel grid, when the format fixes one.
    pub fn grid_shape(&self) -> Option<(usize, usize)> {
        match self {
            EcgFormat::TwelveLead => Some((3, 4)),
            EcgFormat::FifteenLeadPediatric => Some((3, 5)),
            EcgFormat::SixByTwo => Some((6, 2)),
            _ => None,
        }
    }
}

/// Lead expected at (row, col) in the standard printed order for a format.
/// `None` when the format has no fixed layout or the cell is off-grid.
pub fn standard_lead_at(format: EcgFormat, row: usize, col: usize) -> Option<Lead> {
    const TWELVE: [[Lead; 4]; 3] = [
        [Lead::I, Lead::AVR, Lead::V1, Lead::V4],
        [Lead::II, Lead::AVL, Lead::V2, Lead::V5],
        [Lead::III, Lead::AVF, Lead::V3, Lead::V6],
    ];
    const FIFTEEN_EXT: [Lead; 3] = [Lead::V3R, Lead::V4R, Lead::V7];
    const SIX_BY_TWO: [[Lead; 2]; 6] = [
        [Lead::I, Lead::V1],
        [Lead::II, Lead::V2],
        [Lead::III, Lead::V3],
        [Lead::AVR, Lead::V4],
        [Lead::AVL, Lead::V5],
        [Lead::AVF, Lead::V6],
    ];
    match format {
        EcgFormat::TwelveLead => TWELVE.get(row)?.get(col).copied(),
        EcgFormat::FifteenLeadPediatric => {
            if col < 4 {
                TWELVE.get(row)?.get(col).copied()
            } else if col == 4 {
                FIFTEEN_EXT.get(row).copied()
            } else {
                None
            }
        }
        EcgFormat::SixByTwo => SIX_BY_TWO.get(row)?.get(col).copied(),
        _ => None,
    }
}

// ── Panel ─────────────────────────────────────────────────────────────────

/// Where a panel's lead identity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadSource {
    TextLabel,
    PositionInferred,
    Unknown,
}

/// One logical sub-region of the page displaying a single lead's waveform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Panel {
    pub id: usize,
    pub lead: Option<Lead>,
    pub lead_source: LeadSource,
    pub bounds: Bounds,
    /// Isoelectric pixel row; always within `bounds`' vertical range.
    pub baseline_y: f64,
    pub row: usize,
    pub col: usize,
    pub is_rhythm_strip: bool,
    /// Seconds covered by the panel, when known (set during reconstruction).
    pub time_range: Option<(f64, f64)>,
    pub label_confidence: f64,
}

impl Panel {
    pub fn new(id: usize, bounds: Bounds) -> Self {
        let (_, cy) = bounds.center();
        Panel {
            id,
            lead: None,
            lead_source: LeadSource::Unknown,
            bounds,
            baseline_y: cy,
            row: 0,
            col: 0,
            is_rhythm_strip: false,
            time_range: None,
            label_confidence: 0.0,
        }
    }

    /// Clamp `baseline_y` into the panel's vertical extent.
    pub fn clamp_baseline(&mut self) {
        let top = self.bounds.y as f64;
        let bottom = self.bounds.bottom() as f64;
        self.baseline_y = self.baseline_y.clamp(top, bottom);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_matches_known_formats() {
        assert_eq!(EcgFormat::classify(3, 4, 12), EcgFormat::TwelveLead);
        assert_eq!(EcgFormat::classify(3, 5, 15), EcgFormat::FifteenLeadPediatric);
        assert_eq!(EcgFormat::classify(6, 2, 12), EcgFormat::SixByTwo);
        assert_eq!(EcgFormat::classify(1, 1, 1), EcgFormat::SingleStrip);
        assert_eq!(EcgFormat::classify(2, 2, 3), EcgFormat::RhythmOnly);
        assert_eq!(EcgFormat::classify(4, 4, 16), EcgFormat::Unknown);
    }

    #[test]
    fn twelve_lead_map_is_column_major_by_lead_group() {
        assert_eq!(standard_lead_at(EcgFormat::TwelveLead, 0, 0), Some(Lead::I));
        assert_eq!(standard_lead_at(EcgFormat::TwelveLead, 1, 1), Some(Lead::AVL));
        assert_eq!(standard_lead_at(EcgFormat::TwelveLead, 2, 3), Some(Lead::V6));
        assert_eq!(standard_lead_at(EcgFormat::TwelveLead, 3, 0), None);
    }

    #[test]
    fn pediatric_map_extends_with_right_sided_leads() {
        assert_eq!(standard_lead_at(EcgFormat::FifteenLeadPediatric, 0, 4), Some(Lead::V3R));
        assert_eq!(standard_lead_at(EcgFormat::FifteenLeadPediatric, 1, 4), Some(Lead::V4R));
        assert_eq!(standard_lead_at(EcgFormat::FifteenLeadPediatric, 2, 4), Some(Lead::V7));
        assert_eq!(standard_lead_at(EcgFormat::FifteenLeadPediatric, 2, 2), Some(Lead::V3));
    }

    #[test]
    fn baseline_is_clamped_into_panel() {
        let mut p = Panel::new(0, Bounds::new(0, 100, 50, 40));
        p.baseline_y = 20.0;
        p.clamp_baseline();
        assert_eq!(p.baseline_y, 100.0);
        p.baseline_y = 500.0;
        p.clamp_baseline();
        assert_eq!(p.baseline_y, 140.0);
    }
}
