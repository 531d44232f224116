//! LBPH template matcher.
//!
//! Local Binary Pattern histograms over an 8×8 cell grid (radius 2, eight
//! circularly sampled neighbors with bilinear interpolation), compared with
//! the chi-square distance. Produces a raw distance score where **lower is
//! a better match** — the inverse polarity of cosine-style similarities,
//! and the polarity every threshold in this workspace assumes.

use crate::types::{EmployeeId, EmployeeInfo, FaceTemplate, TEMPLATE_LEN, TEMPLATE_SIZE};
use crate::imgproc;
use std::sync::Arc;

const LBP_RADIUS: f32 = 2.0;
const LBP_NEIGHBORS: usize = 8;
const GRID: usize = 8;
const BINS: usize = 256;

/// Scores are reported as mean per-cell chi-square × 100: identical
/// histograms score 0, fully disjoint ones approach 200.
const SCORE_SCALE: f64 = 100.0;

/// Identity attached to a compact training label.
#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub employee: EmployeeId,
    pub name: String,
}

#[derive(Debug, Clone)]
struct TrainedEntry {
    label: usize,
    histogram: Vec<f32>,
}

/// Immutable classifier state built from the full template set.
///
/// Built wholesale by [`train`] and swapped atomically by the engine —
/// never mutated in place. A label appears in `labels` iff at least one
/// valid template for that employee survived validation at build time.
#[derive(Debug)]
pub struct TrainedModel {
    entries: Vec<TrainedEntry>,
    labels: Vec<LabelInfo>,
}

/// Raw nearest-neighbor prediction against a trained model.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    pub label: usize,
    /// Chi-square distance of the best match; lower is better.
    pub distance: f64,
}

impl TrainedModel {
    pub fn label_info(&self, label: usize) -> Option<&LabelInfo> {
        self.labels.get(label)
    }

    pub fn template_count(&self) -> usize {
        self.entries.len()
    }

    pub fn identity_count(&self) -> usize {
        self.labels.len()
    }

    /// Nearest-neighbor search over every stored histogram.
    ///
    /// Returns `None` only for an empty model; numeric sanity of the
    /// distance is the caller's concern.
    pub fn predict(&self, patch: &[u8]) -> Option<Prediction> {
        let probe = lbp_histogram(patch);
        let mut best: Option<Prediction> = None;
        for entry in &self.entries {
            let d = chi_square(&probe, &entry.histogram);
            if best.map_or(true, |b| d < b.distance) {
                best = Some(Prediction {
                    label: entry.label,
                    distance: d,
                });
            }
        }
        best
    }
}

/// Build a model from the full (employee, template) set.
///
/// Invalid templates (wrong byte length) are skipped with a warning; an
/// empty or fully invalid set yields `None` — the soft "untrained"
/// outcome, never an error.
pub fn train(templates: &[(EmployeeInfo, FaceTemplate)]) -> Option<Arc<TrainedModel>> {
    let mut entries = Vec::new();
    let mut labels: Vec<LabelInfo> = Vec::new();

    for (info, template) in templates {
        if template.data.len() != TEMPLATE_LEN {
            tracing::warn!(
                employee = info.id,
                len = template.data.len(),
                expected = TEMPLATE_LEN,
                "skipping template with invalid shape"
            );
            continue;
        }

        let label = match labels.iter().position(|l| l.employee == info.id) {
            Some(idx) => idx,
            None => {
                labels.push(LabelInfo {
                    employee: info.id,
                    name: info.name.clone(),
                });
                labels.len() - 1
            }
        };

        let mut patch = template.data.clone();
        imgproc::normalize_template(&mut patch);
        entries.push(TrainedEntry {
            label,
            histogram: lbp_histogram(&patch),
        });
    }

    if entries.is_empty() {
        tracing::warn!("no valid templates; model left untrained");
        return None;
    }

    tracing::info!(
        templates = entries.len(),
        identities = labels.len(),
        "trained LBPH model"
    );
    Some(Arc::new(TrainedModel { entries, labels }))
}

/// Sample a pixel with bilinear interpolation at a fractional position.
fn sample(patch: &[u8], x: f32, y: f32) -> f32 {
    let size = TEMPLATE_SIZE;
    let x = x.clamp(0.0, (size - 1) as f32);
    let y = y.clamp(0.0, (size - 1) as f32);
    let x0 = x as usize;
    let y0 = y as usize;
    let x1 = (x0 + 1).min(size - 1);
    let y1 = (y0 + 1).min(size - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    patch[y0 * size + x0] as f32 * (1.0 - fx) * (1.0 - fy)
        + patch[y0 * size + x1] as f32 * fx * (1.0 - fy)
        + patch[y1 * size + x0] as f32 * (1.0 - fx) * fy
        + patch[y1 * size + x1] as f32 * fx * fy
}

/// LBP code image over the interior of a canonical patch.
fn lbp_codes(patch: &[u8]) -> Vec<u8> {
    let size = TEMPLATE_SIZE;
    let mut codes = vec![0u8; size * size];
    let margin = LBP_RADIUS.ceil() as usize;

    for y in margin..size - margin {
        for x in margin..size - margin {
            let center = patch[y * size + x] as f32;
            let mut code = 0u8;
            for n in 0..LBP_NEIGHBORS {
                let angle = 2.0 * std::f32::consts::PI * n as f32 / LBP_NEIGHBORS as f32;
                let nx = x as f32 + LBP_RADIUS * angle.cos();
                let ny = y as f32 - LBP_RADIUS * angle.sin();
                if sample(patch, nx, ny) >= center {
                    code |= 1 << n;
                }
            }
            codes[y * size + x] = code;
        }
    }
    codes
}

/// Concatenated per-cell histograms, each normalized to unit sum.
fn lbp_histogram(patch: &[u8]) -> Vec<f32> {
    let size = TEMPLATE_SIZE;
    let cell = size / GRID;
    let codes = lbp_codes(patch);

    let mut hist = vec![0f32; GRID * GRID * BINS];
    for row in 0..GRID {
        for col in 0..GRID {
            let base = (row * GRID + col) * BINS;
            let mut count = 0u32;
            for y in row * cell..(row + 1) * cell {
                for x in col * cell..(col + 1) * cell {
                    hist[base + codes[y * size + x] as usize] += 1.0;
                    count += 1;
                }
            }
            if count > 0 {
                let inv = 1.0 / count as f32;
                for v in &mut hist[base..base + BINS] {
                    *v *= inv;
                }
            }
        }
    }
    hist
}

/// Chi-square distance between two concatenated histograms, scaled to the
/// raw-score range used by the operating thresholds.
fn chi_square(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f64;
    for (&p, &q) in a.iter().zip(b.iter()) {
        let denom = p + q;
        if denom > 0.0 {
            let diff = (p - q) as f64;
            sum += diff * diff / denom as f64;
        }
    }
    sum / (GRID * GRID) as f64 * SCORE_SCALE
}
