use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::geom::{Bounds, Color};
use crate::image::EcgImage;
use crate::panel::{EcgFormat, Panel};

// ── Constants ─────────────────────────────────────────────────────────────

/// Quantization bucket width for the waveform color family.
const COLOR_BUCKET: u32 = 32;

/// Darkness at or above which a pixel can belong to a waveform.
const WAVEFORM_DARKNESS: f64 = 100.0;

/// RGB distance within which a dark pixel counts as family ink.
const FAMILY_DISTANCE: f64 = 96.0;

/// Keep blocks whose waveform-pixel density exceeds this.
const BLOCK_DENSITY: f64 = 0.01;

/// Regions whose center rows sit within this many pixels share a row.
const ROW_CLUSTER_PX: f64 = 80.0;

/// A region wider than this fraction of the page is a rhythm strip.
const RHYTHM_WIDTH_FRACTION: f64 = 0.7;

/// Rhythm strips live in the lower part of the page.
const RHYTHM_MIN_CENTER_Y: f64 = 0.55;

/// Regions narrower than this fraction of the page are stray marks — the
/// calibration pulse, printed text, dirt — never waveform panels.
const MIN_REGION_WIDTH_FRACTION: f64 = 0.04;

// ── Waveform color family ─────────────────────────────────────────────────

fn bucket_of(c: Color) -> (u32, u32, u32) {
    (c.r as u32 / COLOR_BUCKET, c.g as u32 / COLOR_BUCKET, c.b as u32 / COLOR_BUCKET)
}

fn bucket_center(b: (u32, u32, u32)) -> Color {
    let half = COLOR_BUCKET / 2;
    Color::new(
        (b.0 * COLOR_BUCKET + half).min(255) as u8,
        (b.1 * COLOR_BUCKET + half).min(255) as u8,
        (b.2 * COLOR_BUCKET + half).min(255) as u8,
    )
}

/// Dominant dark ink colors on the page: dark pixels quantized into
/// 32-wide buckets, keeping the most populous bucket plus any within half
/// its count. Catches tracings printed in black plus a second accent ink.
pub fn detect_waveform_colors(img: &EcgImage) -> Vec<Color> {
    let mut buckets: HashMap<(u32, u32, u32), u32> = HashMap::new();
    let (w, h) = (img.width() as i32, img.height() as i32);
    for y in (0..h).step_by(2) {
        for x in (0..w).step_by(2) {
            if let Some(c) = img.pixel(x, y) {
                if c.darkness() >= WAVEFORM_DARKNESS {
                    *buckets.entry(bucket_of(c)).or_insert(0) += 1;
                }
            }
        }
    }
    let Some(&top) = buckets.values().max() else {
        return Vec::new();
    };
    let mut family: Vec<(Color, u32)> = buckets
        .into_iter()
        .filter(|&(_, n)| n * 2 >= top)
        .map(|(b, n)| (bucket_center(b), n))
        .collect();
    family.sort_by_key(|&(_, n)| std::cmp::Reverse(n));
    family.truncate(3);
    family.into_iter().map(|(c, _)| c).collect()
}

fn matches_family(c: Color, family: &[Color]) -> bool {
    c.darkness() >= WAVEFORM_DARKNESS && family.iter().any(|&f| c.distance(f) < FAMILY_DISTANCE)
}

// ── Union-find over blocks ────────────────────────────────────────────────

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        UnionFind { parent: (0..n).collect() }
    }

    fn find(&mut self, i: usize) -> usize {
        if self.parent[i] != i {
            let root = self.find(self.parent[i]);
            self.parent[i] = root;
        }
        self.parent[i]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

// ── Regions ───────────────────────────────────────────────────────────────

/// A merged cluster of waveform-dense blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub bounds: Bounds,
    pub center: (f64, f64),
    pub baseline_y: f64,
    pub ink_pixels: u64,
}

/// Result of the rule-based page partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutAnalysis {
    pub panels: Vec<Panel>,
    pub rows: usize,
    pub cols: usize,
    pub format: EcgFormat,
    pub confidence: f64,
    pub waveform_colors: Vec<Color>,
}

/// Per-row ink counts inside a region, used for its baseline estimate: the
/// isoelectric line is the row whose ink count is closest to the median,
/// since peaks are sparse and flat stretches are dense.
fn region_baseline(img: &EcgImage, bounds: Bounds, family: &[Color]) -> f64 {
    let b = bounds.clamp_to(img.width(), img.height());
    let mut counts: Vec<(i32, u32)> = Vec::new();
    for y in b.y..b.bottom() {
        let mut n = 0u32;
        for x in b.x..b.right() {
            if let Some(c) = img.pixel(x, y) {
                if matches_family(c, family) {
                    n += 1;
                }
            }
        }
        if n > 0 {
            counts.push((y, n));
        }
    }
    if counts.is_empty() {
        return bounds.center().1;
    }
    let mut sorted: Vec<u32> = counts.iter().map(|&(_, n)| n).collect();
    sorted.sort_unstable();
    let median = sorted[sorted.len() / 2];
    counts
        .iter()
        .min_by_key(|&&(_, n)| n.abs_diff(median))
        .map(|&(y, _)| y as f64)
        .unwrap_or(bounds.center().1)
}

/// Partition the page into waveform regions: a coarse block grid is scored
/// by ink density, dense blocks are merged 8-connected, and each merged
/// cluster becomes one region with tightened pixel bounds.
pub fn detect_regions(img: &EcgImage, family: &[Color]) -> Vec<Region> {
    if family.is_empty() {
        return Vec::new();
    }
    let (w, h) = (img.width() as i32, img.height() as i32);
    let block = (w.min(h) / 20).clamp(4, 50);
    let bw = (w + block - 1) / block;
    let bh = (h + block - 1) / block;

    // Ink density per block.
    let mut dense = vec![false; (bw * bh) as usize];
    for by in 0..bh {
        for bx in 0..bw {
            let x0 = bx * block;
            let y0 = by * block;
            let x1 = (x0 + block).min(w);
            let y1 = (y0 + block).min(h);
            let mut ink = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    if let Some(c) = img.pixel(x, y) {
                        if matches_family(c, family) {
                            ink += 1;
                        }
                    }
                }
            }
            let area = ((x1 - x0) * (y1 - y0)) as f64;
            dense[(by * bw + bx) as usize] = ink as f64 / area > BLOCK_DENSITY;
        }
    }

    // Merge 8-connected dense blocks.
    let mut uf = UnionFind::new((bw * bh) as usize);
    for by in 0..bh {
        for bx in 0..bw {
            let i = (by * bw + bx) as usize;
            if !dense[i] {
                continue;
            }
            for (dx, dy) in [(1, 0), (0, 1), (1, 1), (-1, 1)] {
                let (nx, ny) = (bx + dx, by + dy);
                if nx >= 0 && nx < bw && ny >= 0 && ny < bh {
                    let j = (ny * bw + nx) as usize;
                    if dense[j] {
                        uf.union(i, j);
                    }
                }
            }
        }
    }

    // Collect block-rect unions per root.
    let mut clusters: HashMap<usize, Bounds> = HashMap::new();
    for by in 0..bh {
        for bx in 0..bw {
            let i = (by * bw + bx) as usize;
            if !dense[i] {
                continue;
            }
            let root = uf.find(i);
            let rect = Bounds::new(
                bx * block,
                by * block,
                ((bx + 1) * block).min(w) - bx * block,
                ((by + 1) * block).min(h) - by * block,
            );
            clusters
                .entry(root)
                .and_modify(|b| *b = b.union(&rect))
                .or_insert(rect);
        }
    }

    // Tighten each cluster to its actual ink extent and score it.
    let mut regions: Vec<Region> = Vec::new();
    for coarse in clusters.into_values() {
        let b = coarse.clamp_to(img.width(), img.height());
        let (mut x0, mut y0, mut x1, mut y1) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        let mut ink = 0u64;
        for y in b.y..b.bottom() {
            for x in b.x..b.right() {
                if let Some(c) = img.pixel(x, y) {
                    if matches_family(c, family) {
                        ink += 1;
                        x0 = x0.min(x);
                        y0 = y0.min(y);
                        x1 = x1.max(x);
                        y1 = y1.max(y);
                    }
                }
            }
        }
        if ink == 0 {
            continue;
        }
        let bounds = Bounds::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1);
        if (bounds.width as f64) < MIN_REGION_WIDTH_FRACTION * img.width() as f64 {
            continue;
        }
        regions.push(Region {
            bounds,
            center: bounds.center(),
            baseline_y: region_baseline(img, bounds, family),
            ink_pixels: ink,
        });
    }
    regions.sort_by(|a, b| {
        (a.bounds.y, a.bounds.x)
            .partial_cmp(&(b.bounds.y, b.bounds.x))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    regions
}

// ── Layout assembly ───────────────────────────────────────────────────────

/// Cluster regions into a (rows × cols) grid, split off rhythm strips,
/// classify the printed format, and emit unlabeled panels.
pub fn analyze_layout(img: &EcgImage) -> LayoutAnalysis {
    let family = detect_waveform_colors(img);
    let regions = detect_regions(img, &family);

    let page_w = img.width() as f64;
    let page_h = img.height() as f64;
    let (main, rhythm): (Vec<&Region>, Vec<&Region>) = regions.iter().partition(|r| {
        !(r.bounds.width as f64 > RHYTHM_WIDTH_FRACTION * page_w
            && r.center.1 > RHYTHM_MIN_CENTER_Y * page_h)
    });

    // Rows: sweep main regions in (y, x) order, opening a new row whenever
    // the center y jumps past the cluster threshold.
    let mut rows: Vec<Vec<&Region>> = Vec::new();
    for &region in &main {
        match rows.last_mut() {
            Some(row)
                if (region.center.1 - row.last().unwrap().center.1).abs() < ROW_CLUSTER_PX =>
            {
                row.push(region)
            }
            _ => rows.push(vec![region]),
        }
    }
    for row in &mut rows {
        row.sort_by(|a, b| {
            a.center.0.partial_cmp(&b.center.0).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    let n_rows = rows.len();
    let n_cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let format = if main.is_empty() {
        EcgFormat::Unknown
    } else {
        EcgFormat::classify(n_rows, n_cols, main.len())
    };
    let confidence = match format.grid_shape() {
        Some((r, c)) if r * c <= main.len() => 0.8,
        _ if format == EcgFormat::SingleStrip || format == EcgFormat::RhythmOnly => 0.8,
        _ => 0.4,
    };

    let mut panels: Vec<Panel> = Vec::new();
    for (row_idx, row) in rows.iter().enumerate() {
        for (col_idx, region) in row.iter().enumerate() {
            let mut p = Panel::new(panels.len(), region.bounds);
            p.baseline_y = region.baseline_y;
            p.row = row_idx;
            p.col = col_idx;
            p.clamp_baseline();
            panels.push(p);
        }
    }
    for region in &rhythm {
        let mut p = Panel::new(panels.len(), region.bounds);
        p.baseline_y = region.baseline_y;
        p.row = n_rows;
        p.col = 0;
        p.is_rhythm_strip = true;
        p.clamp_baseline();
        panels.push(p);
    }

    tracing::debug!(
        regions = regions.len(),
        rows = n_rows,
        cols = n_cols,
        ?format,
        "rule-based layout"
    );
    LayoutAnalysis { panels, rows: n_rows, cols: n_cols, format, confidence, waveform_colors: family }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    /// Draw `rows × cols` sine bursts on a white page, one per panel cell.
    fn panel_page(w: u32, h: u32, rows: u32, cols: u32) -> EcgImage {
        let mut img = RgbaImage::from_pixel(w, h, Rgba([255, 255, 255, 255]));
        let cell_w = w / cols;
        let cell_h = h / rows;
        for r in 0..rows {
            for c in 0..cols {
                let x0 = c * cell_w + cell_w / 5;
                let x1 = (c + 1) * cell_w - cell_w / 5;
                let mid = r * cell_h + cell_h / 2;
                for x in x0..x1 {
                    let y = mid as f64 + ((x as f64) / 8.0).sin() * (cell_h as f64 / 6.0);
                    let y = (y as i32).clamp(0, h as i32 - 1) as u32;
                    for dy in 0..2 {
                        img.put_pixel(x, (y + dy).min(h - 1), Rgba([15, 15, 15, 255]));
                    }
                }
            }
        }
        EcgImage::from_image(img)
    }

    #[test]
    fn black_ink_family_is_detected() {
        let img = panel_page(600, 450, 3, 4);
        let family = detect_waveform_colors(&img);
        assert!(!family.is_empty());
        assert!(family[0].darkness() > 200.0);
    }

    #[test]
    fn three_by_four_page_classifies_as_twelve_lead() {
        let img = panel_page(1200, 900, 3, 4);
        let layout = analyze_layout(&img);
        assert_eq!(layout.rows, 3);
        assert_eq!(layout.cols, 4);
        assert_eq!(layout.format, EcgFormat::TwelveLead);
        assert_eq!(layout.panels.len(), 12);
        assert!((layout.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn three_by_five_page_classifies_as_pediatric() {
        let img = panel_page(1500, 900, 3, 5);
        let layout = analyze_layout(&img);
        assert_eq!(layout.format, EcgFormat::FifteenLeadPediatric);
        assert_eq!(layout.panels.len(), 15);
    }

    #[test]
    fn blank_page_yields_no_panels() {
        let img = crate::image::solid_image(500, 400, Color::WHITE);
        let layout = analyze_layout(&img);
        assert!(layout.panels.is_empty());
        assert_eq!(layout.format, EcgFormat::Unknown);
    }

    #[test]
    fn full_width_bottom_region_is_a_rhythm_strip() {
        let mut img = panel_page(1200, 900, 3, 4).into_rgba();
        // Continuous strip across the bottom tenth of the page.
        for x in 60..1140u32 {
            let y = 870.0 + ((x as f64) / 8.0).sin() * 10.0;
            img.put_pixel(x, y as u32, Rgba([15, 15, 15, 255]));
            img.put_pixel(x, y as u32 + 1, Rgba([15, 15, 15, 255]));
        }
        let layout = analyze_layout(&EcgImage::from_image(img));
        let strips: Vec<_> = layout.panels.iter().filter(|p| p.is_rhythm_strip).collect();
        assert_eq!(strips.len(), 1);
        assert!(strips[0].bounds.width > 800);
        // Main grid is still the 12-lead 3×4.
        assert_eq!(layout.format, EcgFormat::TwelveLead);
    }

    #[test]
    fn panel_baselines_sit_near_cell_centers() {
        let img = panel_page(1200, 900, 3, 4);
        let layout = analyze_layout(&img);
        for p in &layout.panels {
            let (_, cy) = p.bounds.center();
            assert!((p.baseline_y - cy).abs() < 60.0, "baseline {} vs center {cy}", p.baseline_y);
        }
    }
}
