//! Comparator: two canonical results for the same drawing → one report.
//!
//! [`compare`] is pure and deterministic. Field pairs match only on exact
//! equality (no numeric tolerance), aggregate counts are container lengths,
//! and both tie-breaks favour the first argument.
//!
//! [`ComparisonOutcome::save`] persists a report together with both results
//! as `comparison_YYYYmmdd_HHMMSS.json` for offline review.

use crate::error::DrawingError;
use crate::output::DrawingAnalysisResult;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Which argument of [`compare`] a verdict refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    First,
    Second,
}

/// One tracked field, side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub field: String,
    pub first: Value,
    pub second: Value,
    pub matched: bool,
}

/// Container lengths of one result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub dimensions: usize,
    pub features: usize,
    pub tolerances: usize,
    pub surface_finishes: usize,
}

impl ItemCounts {
    pub fn of(result: &DrawingAnalysisResult) -> Self {
        Self {
            dimensions: result.geometry.overall_dimensions.len(),
            features: result.geometry.features.len(),
            tolerances: result.quality.tolerances.len(),
            surface_finishes: result.quality.surface_finishes.len(),
        }
    }
}

/// A dimension label present on at least one side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionComparison {
    pub label: String,
    pub first: Option<f64>,
    pub second: Option<f64>,
    /// Both sides report the label with the same value and unit.
    pub matched: bool,
}

/// Per-side headline figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideSummary {
    pub provider: String,
    pub model: String,
    pub processing_time: f64,
    pub confidence_score: f64,
    pub tokens_used: Option<u64>,
    pub failed: bool,
    pub counts: ItemCounts,
    pub warnings: Vec<String>,
}

impl SideSummary {
    fn of(result: &DrawingAnalysisResult) -> Self {
        let meta = &result.metadata;
        Self {
            provider: meta.provider.clone(),
            model: meta.model_used.clone(),
            processing_time: meta.processing_time,
            confidence_score: meta.confidence_score,
            tokens_used: meta.tokens_used,
            failed: result.is_failure(),
            counts: ItemCounts::of(result),
            warnings: meta.warnings.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    /// Timestamp of the first result.
    pub timestamp: DateTime<Utc>,
    pub first: SideSummary,
    pub second: SideSummary,
    pub fields: Vec<FieldComparison>,
    pub matched_fields: usize,
    pub dimensions: Vec<DimensionComparison>,
    /// Absolute difference in seconds.
    pub time_difference: f64,
    pub confidence_difference: f64,
    pub faster: Side,
    pub higher_confidence: Side,
}

impl ComparisonReport {
    pub fn all_fields_matched(&self) -> bool {
        self.matched_fields == self.fields.len()
    }
}

/// Build the report for two results of the same drawing.
pub fn compare(first: &DrawingAnalysisResult, second: &DrawingAnalysisResult) -> ComparisonReport {
    let fields: Vec<FieldComparison> = tracked_fields(first)
        .into_iter()
        .zip(tracked_fields(second))
        .map(|((field, a), (_, b))| FieldComparison {
            field: field.to_string(),
            matched: a == b,
            first: a,
            second: b,
        })
        .collect();
    let matched_fields = fields.iter().filter(|f| f.matched).count();

    let (ta, tb) = (first.metadata.processing_time, second.metadata.processing_time);
    let (ca, cb) = (first.metadata.confidence_score, second.metadata.confidence_score);

    ComparisonReport {
        timestamp: first.metadata.timestamp,
        first: SideSummary::of(first),
        second: SideSummary::of(second),
        fields,
        matched_fields,
        dimensions: compare_dimensions(first, second),
        time_difference: (ta - tb).abs(),
        confidence_difference: (ca - cb).abs(),
        faster: if tb < ta { Side::Second } else { Side::First },
        higher_confidence: if cb > ca { Side::Second } else { Side::First },
    }
}

/// The scalar fields compared pairwise, in report order.
fn tracked_fields(r: &DrawingAnalysisResult) -> Vec<(&'static str, Value)> {
    let material = r.material.as_ref();
    vec![
        ("title", json!(r.title)),
        ("drawing_number", json!(r.drawing_number)),
        ("revision", json!(r.revision)),
        ("scale", json!(r.scale)),
        ("material.name", json!(material.map(|m| &m.name))),
        ("material.standard", json!(material.and_then(|m| m.standard.as_ref()))),
        ("geometry.part_type", json!(r.geometry.part_type)),
        ("geometry.shape_type", json!(r.geometry.shape_type)),
        ("geometry.complexity_score", json!(r.geometry.complexity_score)),
        ("manufacturing.primary_process", json!(r.manufacturing.primary_process)),
        ("manufacturing.setup_count", json!(r.manufacturing.setup_count)),
        ("manufacturing.difficulty_level", json!(r.manufacturing.difficulty_level)),
    ]
}

/// Labels from the first result in order, then labels only the second has.
fn compare_dimensions(
    first: &DrawingAnalysisResult,
    second: &DrawingAnalysisResult,
) -> Vec<DimensionComparison> {
    let a = &first.geometry.overall_dimensions;
    let b = &second.geometry.overall_dimensions;

    a.keys()
        .chain(b.keys().filter(|k| !a.contains_key(*k)))
        .map(|label| {
            let (da, db) = (a.get(label), b.get(label));
            DimensionComparison {
                label: label.clone(),
                first: da.map(|d| d.value),
                second: db.map(|d| d.value),
                matched: matches!((da, db), (Some(x), Some(y)) if x.value == y.value && x.unit == y.unit),
            }
        })
        .collect()
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Both results plus their comparison, as returned by
/// [`crate::analyze::compare`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonOutcome {
    pub first: DrawingAnalysisResult,
    pub second: DrawingAnalysisResult,
    pub report: ComparisonReport,
}

impl ComparisonOutcome {
    pub fn new(first: DrawingAnalysisResult, second: DrawingAnalysisResult) -> Self {
        let report = compare(&first, &second);
        Self {
            first,
            second,
            report,
        }
    }

    /// Write `comparison_<local timestamp>.json` into `dir`, creating it if
    /// needed. The file appears atomically (temp file + rename).
    pub fn save(&self, dir: &Path) -> Result<PathBuf, DrawingError> {
        let name = format!("comparison_{}.json", Local::now().format("%Y%m%d_%H%M%S"));
        let path = dir.join(name);
        let write_err = |source: std::io::Error| DrawingError::ReportWriteFailed {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(write_err)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        serde_json::to_writer_pretty(&mut tmp, self).map_err(|e| write_err(e.into()))?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.persist(&path).map_err(|e| write_err(e.error))?;

        info!("Saved comparison report to {}", path.display());
        Ok(path)
    }
}
