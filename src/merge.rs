use std::collections::HashMap;

use crate::geom::Bounds;
use crate::oracle::OracleAnalysis;
use crate::panel::{standard_lead_at, EcgFormat, LeadSource, Panel};

// ── Constants ─────────────────────────────────────────────────────────────

/// Minimum fraction of an oracle panel's area that must fall inside the
/// image for its geometry to be trusted.
const MIN_INSIDE_FRACTION: f64 = 0.7;

/// Oracle cluster spread (y within a putative row, x within a putative
/// column) beyond this fraction of the mean panel extent on that axis
/// marks the geometry inconsistent.
const MAX_AXIS_SPREAD_FRACTION: f64 = 0.3;

// ── 1-D clustering ────────────────────────────────────────────────────────

/// Greedy 1-D clustering of sorted values: a new cluster opens whenever the
/// next value is farther than `threshold` from the running cluster mean.
/// Returns sorted cluster centers.
fn cluster_1d(values: &[f64], threshold: f64) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut centers: Vec<f64> = Vec::new();
    let mut sum = 0.0;
    let mut count = 0usize;
    for v in sorted {
        if count > 0 && (v - sum / count as f64).abs() > threshold {
            centers.push(sum / count as f64);
            sum = 0.0;
            count = 0;
        }
        sum += v;
        count += 1;
    }
    if count > 0 {
        centers.push(sum / count as f64);
    }
    centers
}

fn nearest_cluster(centers: &[f64], v: f64) -> usize {
    centers
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            (*a - v).abs().partial_cmp(&(*b - v).abs()).unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Re-derive (row, col) for every main-grid panel from its center, using
/// cluster thresholds of half the largest panel height / width. Rhythm
/// strips keep a row index past the main grid.
pub fn assign_grid_positions(panels: &mut [Panel]) -> (usize, usize) {
    let main: Vec<&Panel> = panels.iter().filter(|p| !p.is_rhythm_strip).collect();
    if main.is_empty() {
        return (0, 0);
    }
    let max_h = main.iter().map(|p| p.bounds.height).max().unwrap_or(1).max(1) as f64;
    let max_w = main.iter().map(|p| p.bounds.width).max().unwrap_or(1).max(1) as f64;
    let ys: Vec<f64> = main.iter().map(|p| p.bounds.center().1).collect();
    let xs: Vec<f64> = main.iter().map(|p| p.bounds.center().0).collect();
    let row_centers = cluster_1d(&ys, max_h / 2.0);
    let col_centers = cluster_1d(&xs, max_w / 2.0);

    let n_rows = row_centers.len();
    for p in panels.iter_mut() {
        if p.is_rhythm_strip {
            p.row = n_rows;
            p.col = 0;
        } else {
            let (cx, cy) = p.bounds.center();
            p.row = nearest_cluster(&row_centers, cy);
            p.col = nearest_cluster(&col_centers, cx);
        }
    }
    (row_centers.len(), col_centers.len())
}

// ── Oracle geometry validation ────────────────────────────────────────────

fn inside_fraction(b: &Bounds, img_w: u32, img_h: u32) -> f64 {
    let area = b.area();
    if area <= 0 {
        return 0.0;
    }
    b.clamp_to(img_w, img_h).area() as f64 / area as f64
}

/// Standard deviation of a cluster; zero for singletons.
fn cluster_spread(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Whether the oracle's panel rectangles are usable as geometry, or only
/// their labels should survive. Rectangles must lie largely inside the
/// image and form coherent rows (agreeing in y) and columns (agreeing
/// in x across rows).
fn oracle_geometry_usable(analysis: &OracleAnalysis, img_w: u32, img_h: u32) -> bool {
    let boxed: Vec<&Bounds> =
        analysis.panels.iter().filter_map(|p| p.bounds.as_ref()).collect();
    if boxed.is_empty() {
        return false;
    }
    let mean_inside =
        boxed.iter().map(|b| inside_fraction(b, img_w, img_h)).sum::<f64>() / boxed.len() as f64;
    if mean_inside < MIN_INSIDE_FRACTION {
        return false;
    }

    let mean_h = boxed.iter().map(|b| b.height as f64).sum::<f64>() / boxed.len() as f64;
    let mean_w = boxed.iter().map(|b| b.width as f64).sum::<f64>() / boxed.len() as f64;
    let ys: Vec<f64> = boxed.iter().map(|b| b.center().1).collect();
    let xs: Vec<f64> = boxed.iter().map(|b| b.center().0).collect();

    // Row coherence: panels assigned to the same putative row must agree
    // in y within a fraction of the mean panel height.
    let row_centers = cluster_1d(&ys, mean_h / 2.0);
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); row_centers.len()];
    for (i, &y) in ys.iter().enumerate() {
        rows[nearest_cluster(&row_centers, y)].push(i);
    }
    for members in &rows {
        let member_ys: Vec<f64> = members.iter().map(|&i| ys[i]).collect();
        if cluster_spread(&member_ys) > MAX_AXIS_SPREAD_FRACTION * mean_h {
            return false;
        }
    }

    // Column coherence: order each row by x; the k-th panel of every row
    // forms a putative column and must agree in x within the same fraction
    // of the mean panel width.
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for members in &rows {
        let mut row_xs: Vec<f64> = members.iter().map(|&i| xs[i]).collect();
        row_xs.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        for (k, &x) in row_xs.iter().enumerate() {
            if columns.len() <= k {
                columns.push(Vec::new());
            }
            columns[k].push(x);
        }
    }
    for column in &columns {
        if cluster_spread(column) > MAX_AXIS_SPREAD_FRACTION * mean_w {
            return false;
        }
    }
    true
}

// ── Merge ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    pub panels: Vec<Panel>,
    /// Oracle baselines for panels that matched one, keyed by panel id.
    pub oracle_baselines: HashMap<usize, f64>,
    /// Oracle sparse traces, (x fraction, y pixel), keyed by panel id.
    pub oracle_traces: HashMap<usize, Vec<(f64, f64)>>,
    pub used_oracle_geometry: bool,
    pub text_labels: usize,
    pub inferred_labels: usize,
}

/// Combine rule-based geometry with oracle labels into the hybrid panel
/// set. Rule-based rectangles win whenever they exist; the oracle
/// contributes labels (always) and geometry (only when the rule-based
/// detector found nothing and the oracle's rectangles are coherent).
pub fn merge_panels(
    rule_panels: &[Panel],
    oracle: Option<&OracleAnalysis>,
    format: EcgFormat,
    layout_confidence: f64,
    img_w: u32,
    img_h: u32,
) -> MergeOutcome {
    let geometry_usable =
        oracle.is_some_and(|a| oracle_geometry_usable(a, img_w, img_h));

    let mut out = MergeOutcome::default();
    if !rule_panels.is_empty() {
        out.panels = rule_panels.to_vec();
    } else if let (Some(analysis), true) = (oracle, geometry_usable) {
        // Oracle-only geometry: adopt its rectangles wholesale.
        out.used_oracle_geometry = true;
        for p in &analysis.panels {
            let Some(bounds) = p.bounds else { continue };
            let bounds = bounds.clamp_to(img_w, img_h);
            if bounds.area() == 0 {
                continue;
            }
            let mut panel = Panel::new(out.panels.len(), bounds);
            panel.is_rhythm_strip = p.is_rhythm_strip;
            if let Some(y) = p.baseline_y {
                panel.baseline_y = y;
                panel.clamp_baseline();
            }
            out.panels.push(panel);
        }
    }
    if out.panels.is_empty() {
        return out;
    }

    assign_grid_positions(&mut out.panels);

    // Label transfer.
    if let Some(analysis) = oracle {
        if geometry_usable {
            // Match by nearest center with overlapping rectangles.
            for panel in out.panels.iter_mut() {
                let (px, py) = panel.bounds.center();
                let matched = analysis
                    .panels
                    .iter()
                    .filter(|o| {
                        o.bounds.is_some_and(|b| b.overlaps(&panel.bounds))
                    })
                    .min_by(|a, b| {
                        let da = center_distance(a.bounds.as_ref().unwrap(), px, py);
                        let db = center_distance(b.bounds.as_ref().unwrap(), px, py);
                        da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                    });
                if let Some(o) = matched {
                    if let Some(lead) = o.lead {
                        panel.lead = Some(lead);
                        panel.lead_source = LeadSource::TextLabel;
                        panel.label_confidence = o.confidence;
                        out.text_labels += 1;
                    }
                    if let Some(y) = o.baseline_y {
                        out.oracle_baselines.insert(panel.id, y);
                    }
                    if !o.trace.is_empty() {
                        out.oracle_traces.insert(panel.id, o.trace.clone());
                    }
                }
            }
        } else {
            // Geometry discarded: transfer labels through declared (row, col).
            let mut by_cell: HashMap<(usize, usize), &crate::oracle::LabeledPanel> =
                HashMap::new();
            for o in &analysis.panels {
                if let (Some(r), Some(c)) = (o.row, o.col) {
                    by_cell.entry((r, c)).or_insert(o);
                }
            }
            for panel in out.panels.iter_mut() {
                if let Some(o) = by_cell.get(&(panel.row, panel.col)) {
                    if let Some(lead) = o.lead {
                        panel.lead = Some(lead);
                        panel.lead_source = LeadSource::TextLabel;
                        panel.label_confidence = o.confidence;
                        out.text_labels += 1;
                    }
                }
            }
        }
    }

    // Position-inferred fill from the standard layout for this format.
    let inferred_confidence = layout_confidence.min(0.7);
    for panel in out.panels.iter_mut() {
        if panel.lead.is_none() && !panel.is_rhythm_strip {
            if let Some(lead) = standard_lead_at(format, panel.row, panel.col) {
                panel.lead = Some(lead);
                panel.lead_source = LeadSource::PositionInferred;
                panel.label_confidence = inferred_confidence;
                out.inferred_labels += 1;
            }
        }
    }

    // Deterministic ordering and ids.
    out.panels.sort_by_key(|p| (p.is_rhythm_strip, p.row, p.col));
    let mut baselines = HashMap::new();
    let mut traces = HashMap::new();
    for (new_id, panel) in out.panels.iter_mut().enumerate() {
        if let Some(&y) = out.oracle_baselines.get(&panel.id) {
            baselines.insert(new_id, y);
        }
        if let Some(t) = out.oracle_traces.get(&panel.id) {
            traces.insert(new_id, t.clone());
        }
        panel.id = new_id;
    }
    out.oracle_baselines = baselines;
    out.oracle_traces = traces;

    tracing::debug!(
        panels = out.panels.len(),
        text_labels = out.text_labels,
        inferred = out.inferred_labels,
        oracle_geometry = out.used_oracle_geometry,
        "panel merge"
    );
    out
}

fn center_distance(b: &Bounds, x: f64, y: f64) -> f64 {
    let (cx, cy) = b.center();
    let (dx, dy) = (cx - x, cy - y);
    (dx * dx + dy * dy).sqrt()
}
