//! Result normalisation: provider-native output → [`DrawingAnalysisResult`].
//!
//! Two native shapes exist:
//!
//! * a single JSON object (vision-chat and reasoning-effort providers), read
//!   leniently: numbers may arrive as strings, features may list their
//!   dimensions inline, and unknown keys are ignored;
//! * a set of typed extraction fragments (structured-extraction provider).
//!
//! Both go through the same rules afterwards: items whose own confidence is
//! below the threshold are dropped, the complexity score is recomputed from
//! the surviving item counts, and every score is clamped to its range.

use crate::config::ProviderId;
use crate::error::DrawingError;
use crate::output::{
    AnalysisMetadata, Difficulty, DimensionInfo, DrawingAnalysisResult, FeatureInfo,
    GeometryAnalysis, ManufacturingAnalysis, MaterialInfo, QualityRequirements,
    SurfaceFinishInfo, ToleranceInfo, UNKNOWN, UNKNOWN_TITLE,
};
use crate::providers::extraction::{FragmentKind, FragmentSet};
use crate::providers::{NativePayload, ProviderNativeResult};
use chrono::Utc;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

/// Confidence assumed for a free-text reply that reports none.
pub const DEFAULT_REPLY_CONFIDENCE: f64 = 0.8;
/// Confidence assumed for structured extraction without its own score.
pub const DEFAULT_EXTRACTION_CONFIDENCE: f64 = 0.95;
/// How many dimension labels an extraction result marks as critical.
pub const CRITICAL_DIMENSION_COUNT: usize = 5;
/// Primary process assumed when insights arrived without any method.
pub const DEFAULT_PRIMARY_PROCESS: &str = "CNC Machining";

/// Per-request inputs to normalisation.
#[derive(Debug, Clone)]
pub struct NormalizeOptions<'a> {
    /// Items with an explicit confidence below this are dropped. Clamped to [0, 1].
    pub confidence_threshold: f64,
    /// Used as the title when an extraction carries no designation.
    pub filename: &'a str,
    /// Attach the native payload as `raw_response`.
    pub include_raw: bool,
}

// ── Complexity ───────────────────────────────────────────────────────────

/// Provider-agnostic richness score in [0, 10], rounded to two decimals.
///
/// `min(0.3·d, 3) + min(0.4·f, 3) + min(0.5·t, 4)`, total capped at 10.
pub fn complexity_score(dimensions: usize, features: usize, tolerances: usize) -> f64 {
    let d = (dimensions as f64 * 0.3).min(3.0);
    let f = (features as f64 * 0.4).min(3.0);
    let t = (tolerances as f64 * 0.5).min(4.0);
    let total = (d + f + t).min(10.0);
    (total * 100.0).round() / 100.0
}

/// Clamp into `[lo, hi]`, mapping NaN to `lo`.
fn clamp_score(v: f64, lo: f64, hi: f64) -> f64 {
    if v.is_nan() {
        lo
    } else {
        v.clamp(lo, hi)
    }
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Map a provider's native output onto the canonical schema.
pub fn normalize(native: ProviderNativeResult, opts: &NormalizeOptions<'_>) -> DrawingAnalysisResult {
    let threshold = clamp_score(opts.confidence_threshold, 0.0, 1.0);
    let mut filter = ConfidenceFilter::new(threshold);

    let mut result = match &native.payload {
        NativePayload::Json(value) => from_reply(value, &mut filter),
        NativePayload::Extraction(set) => from_fragments(set, opts.filename, &mut filter),
    };

    let (d, f, t) = result.item_counts();
    result.geometry.complexity_score = complexity_score(d, f, t);

    let mut warnings = native.warnings.clone();
    warnings.append(&mut result.metadata.warnings);
    if let Some(w) = filter.warning() {
        warnings.push(w);
    }

    result.metadata = AnalysisMetadata {
        provider: native.provider.to_string(),
        model_used: native.model.clone(),
        processing_time: native.elapsed.as_secs_f64(),
        confidence_score: clamp_score(result.metadata.confidence_score, 0.0, 1.0),
        tokens_used: native.tokens_used,
        warnings,
        timestamp: Utc::now(),
    };
    result.manufacturing.setup_count = result.manufacturing.setup_count.max(1);

    if opts.include_raw {
        result.raw_response = Some(match native.payload {
            NativePayload::Json(value) => value,
            NativePayload::Extraction(set) => set.to_value(),
        });
    }

    debug!(
        "Normalised {} result: {} dims, {} features, {} tolerances (dropped {})",
        native.provider, d, f, t, filter.dropped
    );
    result
}

/// The minimal result returned in place of a failed provider call.
///
/// Zero confidence, sentinel classifications, and one warning carrying the
/// user-facing error message.
pub fn normalize_failure(
    provider: ProviderId,
    model: &str,
    elapsed: Duration,
    error: &DrawingError,
    filename: &str,
) -> DrawingAnalysisResult {
    let title = if filename.trim().is_empty() {
        UNKNOWN_TITLE.to_string()
    } else {
        filename.to_string()
    };
    let report = error.report();

    DrawingAnalysisResult {
        title,
        revision: None,
        drawing_number: None,
        scale: None,
        material: None,
        surface_finish: None,
        geometry: GeometryAnalysis::default(),
        manufacturing: ManufacturingAnalysis::default(),
        quality: QualityRequirements::default(),
        general_notes: Vec::new(),
        design_recommendations: Vec::new(),
        metadata: AnalysisMetadata {
            provider: provider.to_string(),
            model_used: model.to_string(),
            processing_time: elapsed.as_secs_f64(),
            confidence_score: 0.0,
            tokens_used: None,
            warnings: vec![format!("Analysis failed: [{}] {}", report.kind, report.message)],
            timestamp: Utc::now(),
        },
        raw_response: None,
    }
}

// ── Confidence filter ────────────────────────────────────────────────────

struct ConfidenceFilter {
    threshold: f64,
    dropped: usize,
}

impl ConfidenceFilter {
    fn new(threshold: f64) -> Self {
        Self {
            threshold,
            dropped: 0,
        }
    }

    /// Keep items without a score; drop those scored below the threshold.
    fn keep(&mut self, item: &Map<String, Value>) -> bool {
        let score = item
            .get("confidence")
            .or_else(|| item.get("confidence_score"))
            .and_then(as_score);
        match score {
            Some(c) if clamp_score(c, 0.0, 1.0) < self.threshold => {
                self.dropped += 1;
                false
            }
            _ => true,
        }
    }

    fn warning(&self) -> Option<String> {
        (self.dropped > 0).then(|| {
            format!(
                "Dropped {} item(s) below confidence threshold {:.2}",
                self.dropped, self.threshold
            )
        })
    }
}

// ── Lenient value readers ────────────────────────────────────────────────

/// A finite number, or a string holding one. "NaN" and "inf" are rejected.
fn as_f64(v: &Value) -> Option<f64> {
    as_score(v).filter(|n| n.is_finite())
}

/// Like [`as_f64`] but keeps non-finite values for [`clamp_score`] to pin.
fn as_score(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(as_text)
}

fn text_list(obj: &Map<String, Value>, key: &str) -> Vec<String> {
    match obj.get(key) {
        Some(Value::Array(items)) => items.iter().filter_map(as_text).collect(),
        Some(v) => as_text(v).into_iter().collect(),
        None => Vec::new(),
    }
}

fn object<'v>(obj: &'v Map<String, Value>, key: &str) -> Option<&'v Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

fn objects<'v>(obj: &'v Map<String, Value>, key: &str) -> impl Iterator<Item = &'v Map<String, Value>> {
    obj.get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object)
}

// ── Item mappers ─────────────────────────────────────────────────────────

fn dimension(v: &Value) -> Option<DimensionInfo> {
    match v {
        Value::Object(o) => Some(DimensionInfo {
            value: o.get("value").and_then(as_f64)?,
            unit: text(o, "unit").unwrap_or_else(|| "mm".to_string()),
            tolerance: text(o, "tolerance"),
            location: text(o, "location"),
        }),
        other => Some(DimensionInfo {
            value: as_f64(other)?,
            ..DimensionInfo::default()
        }),
    }
}

const FEATURE_KEYS: &[&str] = &[
    "type",
    "kind",
    "quantity",
    "dimensions",
    "position",
    "notes",
    "confidence",
    "confidence_score",
];

fn feature(o: &Map<String, Value>) -> FeatureInfo {
    // Features may list their sizes inline: {"type":"hole","diameter":6.5,…}.
    let dimensions: IndexMap<String, Value> = match object(o, "dimensions") {
        Some(d) => d.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => o
            .iter()
            .filter(|(k, _)| !FEATURE_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    FeatureInfo {
        kind: text(o, "type")
            .or_else(|| text(o, "kind"))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        quantity: o
            .get("quantity")
            .and_then(as_f64)
            .map(|q| q.max(1.0) as u32)
            .unwrap_or(1),
        dimensions,
        position: text(o, "position"),
        notes: text(o, "notes"),
    }
}

fn tolerance(o: &Map<String, Value>) -> Option<ToleranceInfo> {
    Some(ToleranceInfo {
        kind: text(o, "type").unwrap_or_else(|| "dimensional".to_string()),
        value: text(o, "value")?,
        reference: text(o, "reference"),
    })
}

fn surface_finish(o: &Map<String, Value>) -> Option<SurfaceFinishInfo> {
    let kind = text(o, "type")?;
    Some(SurfaceFinishInfo {
        description: text(o, "description").unwrap_or_else(|| kind.clone()),
        kind,
        roughness: text(o, "roughness"),
        color: text(o, "color"),
    })
}

fn material(v: &Value) -> Option<MaterialInfo> {
    match v {
        Value::Object(o) => Some(MaterialInfo {
            name: text(o, "name")?,
            standard: text(o, "standard"),
            density: o.get("density").and_then(as_f64),
            hardness: text(o, "hardness"),
        }),
        other => Some(MaterialInfo {
            name: as_text(other)?,
            standard: None,
            density: None,
            hardness: None,
        }),
    }
}

/// Collect dimensions from either a label → value map or a list of
/// `{label, value, …}` objects, applying the confidence filter.
fn dimensions_from(
    v: Option<&Value>,
    filter: &mut ConfidenceFilter,
    warnings: &mut Vec<String>,
) -> IndexMap<String, DimensionInfo> {
    let mut out = IndexMap::new();
    let entries: Vec<(String, &Value)> = match v {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let label = item
                    .as_object()
                    .and_then(|o| text(o, "label").or_else(|| text(o, "name")))
                    .unwrap_or_else(|| format!("dim_{}", i + 1));
                (label, item)
            })
            .collect(),
        _ => Vec::new(),
    };

    for (label, value) in entries {
        if let Some(o) = value.as_object() {
            if !filter.keep(o) {
                continue;
            }
        }
        match dimension(value) {
            Some(d) => {
                out.insert(unique_label(&out, label), d);
            }
            None => warnings.push(format!("Ignored dimension '{label}': no numeric value")),
        }
    }
    out
}

/// `label`, or `label_2`, `label_3`, … when a drawing repeats a callout.
fn unique_label(taken: &IndexMap<String, DimensionInfo>, label: String) -> String {
    if !taken.contains_key(&label) {
        return label;
    }
    (2..)
        .map(|n| format!("{label}_{n}"))
        .find(|candidate| !taken.contains_key(candidate))
        .unwrap_or(label)
}

fn features_from<'v>(
    items: impl Iterator<Item = &'v Map<String, Value>>,
    filter: &mut ConfidenceFilter,
) -> Vec<FeatureInfo> {
    items.filter(|o| filter.keep(o)).map(feature).collect()
}

fn tolerances_from<'v>(
    items: impl Iterator<Item = &'v Map<String, Value>>,
    filter: &mut ConfidenceFilter,
) -> Vec<ToleranceInfo> {
    items
        .filter(|o| filter.keep(o))
        .filter_map(tolerance)
        .collect()
}

// ── Free-text reply mapping ──────────────────────────────────────────────

fn from_reply(value: &Value, filter: &mut ConfidenceFilter) -> DrawingAnalysisResult {
    let empty = Map::new();
    let root = value.as_object().unwrap_or(&empty);
    let geometry = object(root, "geometry").unwrap_or(&empty);
    let manufacturing = object(root, "manufacturing").unwrap_or(&empty);
    let quality = object(root, "quality").unwrap_or(&empty);
    let mut warnings = text_list(root, "warnings");

    let overall_dimensions = dimensions_from(geometry.get("overall_dimensions"), filter, &mut warnings);
    let features = features_from(objects(geometry, "features"), filter);
    let tolerances = tolerances_from(objects(quality, "tolerances"), filter);

    let confidence = root
        .get("confidence_score")
        .or_else(|| object(root, "metadata").and_then(|m| m.get("confidence_score")))
        .and_then(as_score)
        .unwrap_or(DEFAULT_REPLY_CONFIDENCE);

    DrawingAnalysisResult {
        title: text(root, "title").unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        revision: text(root, "revision"),
        drawing_number: text(root, "drawing_number"),
        scale: text(root, "scale"),
        material: root.get("material").and_then(material),
        surface_finish: object(root, "surface_finish").and_then(surface_finish),
        geometry: GeometryAnalysis {
            part_type: text(geometry, "part_type").unwrap_or_else(|| UNKNOWN.to_string()),
            shape_type: text(geometry, "shape_type").unwrap_or_else(|| UNKNOWN.to_string()),
            overall_dimensions,
            features,
            complexity_score: 0.0,
        },
        manufacturing: ManufacturingAnalysis {
            primary_process: text(manufacturing, "primary_process")
                .unwrap_or_else(|| UNKNOWN.to_string()),
            secondary_processes: text_list(manufacturing, "secondary_processes"),
            setup_count: manufacturing
                .get("setup_count")
                .and_then(as_f64)
                .map(|n| n.max(1.0) as u32)
                .unwrap_or(1),
            estimated_operations: text_list(manufacturing, "estimated_operations"),
            difficulty_level: text(manufacturing, "difficulty_level")
                .map(|s| Difficulty::parse_lenient(&s))
                .unwrap_or_default(),
            special_requirements: text_list(manufacturing, "special_requirements"),
        },
        quality: QualityRequirements {
            tolerances,
            surface_finishes: objects(quality, "surface_finishes")
                .filter_map(surface_finish)
                .collect(),
            inspection_notes: text_list(quality, "inspection_notes"),
            critical_dimensions: text_list(quality, "critical_dimensions"),
        },
        general_notes: text_list(root, "general_notes"),
        design_recommendations: text_list(root, "design_recommendations"),
        metadata: placeholder_metadata(confidence, warnings),
        raw_response: None,
    }
}

// ── Extraction fragment mapping ──────────────────────────────────────────

fn from_fragments(
    set: &FragmentSet,
    filename: &str,
    filter: &mut ConfidenceFilter,
) -> DrawingAnalysisResult {
    let empty = Map::new();
    let metadata = set
        .get(FragmentKind::Metadata)
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let features = set
        .get(FragmentKind::Features)
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let insights = set.get(FragmentKind::Insights).and_then(Value::as_object);
    let mut warnings = Vec::new();

    let title = text(metadata, "designation")
        .or_else(|| text(metadata, "title"))
        .or_else(|| (!filename.trim().is_empty()).then(|| filename.to_string()))
        .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

    let overall_dimensions = dimensions_from(features.get("dimensions"), filter, &mut warnings);
    let feature_list = features_from(objects(features, "features"), filter);
    let tolerances = tolerances_from(objects(features, "tolerances"), filter);

    let manufacturing = match insights {
        Some(ins) => {
            let methods = text_list(ins, "manufacturing_methods");
            let mut methods = methods.into_iter();
            ManufacturingAnalysis {
                primary_process: methods
                    .next()
                    .unwrap_or_else(|| DEFAULT_PRIMARY_PROCESS.to_string()),
                secondary_processes: methods.collect(),
                setup_count: ins
                    .get("setup_count")
                    .and_then(as_f64)
                    .map(|n| n.max(1.0) as u32)
                    .unwrap_or(1),
                estimated_operations: text_list(ins, "operations"),
                difficulty_level: text(ins, "difficulty")
                    .map(|s| Difficulty::parse_lenient(&s))
                    .unwrap_or(Difficulty::Medium),
                special_requirements: text_list(ins, "special_requirements"),
            }
        }
        None => ManufacturingAnalysis::default(),
    };

    let critical_dimensions = overall_dimensions
        .keys()
        .take(CRITICAL_DIMENSION_COUNT)
        .cloned()
        .collect();

    let general_notes = vec![
        format!("Detected {} dimensions", overall_dimensions.len()),
        format!("Found {} GD&T tolerances", tolerances.len()),
        format!("Identified {} special features", feature_list.len()),
    ];

    let confidence = metadata
        .get("confidence")
        .and_then(as_score)
        .unwrap_or(DEFAULT_EXTRACTION_CONFIDENCE);

    DrawingAnalysisResult {
        title,
        revision: text(metadata, "revision"),
        drawing_number: text(metadata, "drawing_number"),
        scale: text(metadata, "scale"),
        material: metadata.get("material").and_then(material),
        surface_finish: None,
        geometry: GeometryAnalysis {
            part_type: text(metadata, "part_type").unwrap_or_else(|| UNKNOWN.to_string()),
            shape_type: text(metadata, "shape_type").unwrap_or_else(|| UNKNOWN.to_string()),
            overall_dimensions,
            features: feature_list,
            complexity_score: 0.0,
        },
        manufacturing,
        quality: QualityRequirements {
            tolerances,
            surface_finishes: objects(features, "surface_finishes")
                .filter_map(surface_finish)
                .collect(),
            inspection_notes: text_list(metadata, "notes"),
            critical_dimensions,
        },
        general_notes,
        design_recommendations: Vec::new(),
        metadata: placeholder_metadata(confidence, warnings),
        raw_response: None,
    }
}

/// Mapper-level metadata; provider, timing and tokens are filled in by
/// [`normalize`].
fn placeholder_metadata(confidence: f64, warnings: Vec<String>) -> AnalysisMetadata {
    AnalysisMetadata {
        provider: String::new(),
        model_used: String::new(),
        processing_time: 0.0,
        confidence_score: confidence,
        tokens_used: None,
        warnings,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn native(payload: NativePayload) -> ProviderNativeResult {
        ProviderNativeResult {
            provider: ProviderId::VisionChat,
            model: "gpt-4.1".into(),
            payload,
            tokens_used: Some(1234),
            elapsed: Duration::from_millis(2500),
            warnings: vec![],
        }
    }

    fn opts(threshold: f64) -> NormalizeOptions<'static> {
        NormalizeOptions {
            confidence_threshold: threshold,
            filename: "bracket.png",
            include_raw: false,
        }
    }

    fn reply() -> Value {
        json!({
            "title": "Mounting bracket",
            "drawing_number": 4711,
            "revision": "B",
            "scale": "1:2",
            "material": {"name": "AlMg3", "standard": "DIN EN 573-3", "density": "2.66"},
            "surface_finish": {"type": "anodize", "description": "Black anodise"},
            "geometry": {
                "part_type": "bracket",
                "shape_type": "L-profile",
                "overall_dimensions": {
                    "length": {"value": 120.0, "unit": "mm", "tolerance": "±0.2", "confidence": 0.9},
                    "width": {"value": "80", "confidence": 0.5},
                    "height": 30
                },
                "features": [
                    {"type": "hole", "diameter": 6.5, "quantity": 4, "confidence": 0.8},
                    {"type": "chamfer", "quantity": 2, "confidence": 0.3}
                ],
                "complexity_score": 9.9
            },
            "manufacturing": {
                "primary_process": "CNC milling",
                "secondary_processes": ["drilling", "tapping"],
                "setup_count": 0,
                "difficulty_level": "orta"
            },
            "quality": {
                "tolerances": [
                    {"type": "geometric", "value": "⊥ 0.05 A", "confidence": 0.95},
                    {"type": "dimensional", "value": 0.1, "confidence": 0.6}
                ],
                "critical_dimensions": ["length"]
            },
            "general_notes": ["Deburr all edges"],
            "confidence_score": 1.7
        })
    }

    #[test]
    fn complexity_formula_and_caps() {
        assert_eq!(complexity_score(0, 0, 0), 0.0);
        assert_eq!(complexity_score(1, 1, 0), 0.7);
        assert_eq!(complexity_score(10, 0, 0), 3.0);
        assert_eq!(complexity_score(11, 0, 0), 3.0);
        assert_eq!(complexity_score(0, 0, 8), 4.0);
        assert_eq!(complexity_score(20, 20, 20), 10.0);
        assert_eq!(complexity_score(usize::MAX / 2, usize::MAX / 2, usize::MAX / 2), 10.0);
    }

    #[test]
    fn reply_is_mapped_and_filtered() {
        let r = normalize(native(NativePayload::Json(reply())), &opts(0.7));

        assert_eq!(r.title, "Mounting bracket");
        assert_eq!(r.drawing_number.as_deref(), Some("4711"));
        assert_eq!(r.material.as_ref().unwrap().density, Some(2.66));

        let dims: Vec<&str> = r.geometry.overall_dimensions.keys().map(|s| s.as_str()).collect();
        assert_eq!(dims, ["length", "height"], "0.5-confidence width dropped, unscored height kept");
        assert_eq!(r.geometry.features.len(), 1);
        assert_eq!(r.geometry.features[0].dimensions["diameter"], json!(6.5));
        assert_eq!(r.quality.tolerances.len(), 1);

        // Recomputed, not the provider's 9.9.
        assert_eq!(r.geometry.complexity_score, complexity_score(2, 1, 1));
        assert_eq!(r.manufacturing.setup_count, 1);
        assert_eq!(r.manufacturing.difficulty_level, Difficulty::Medium);
        assert_eq!(r.metadata.confidence_score, 1.0);
        assert_eq!(r.metadata.tokens_used, Some(1234));
        assert_eq!(r.metadata.processing_time, 2.5);
        assert_eq!(r.metadata.provider, "vision-chat");
        assert!(r.metadata.warnings.iter().any(|w| w.contains("Dropped 3")));
        assert!(r.raw_response.is_none());
    }

    #[test]
    fn higher_threshold_yields_subset() {
        let mut previous = (usize::MAX, usize::MAX, usize::MAX);
        for t in [0.0, 0.4, 0.55, 0.7, 0.85, 0.92, 1.0] {
            let r = normalize(native(NativePayload::Json(reply())), &opts(t));
            let counts = r.item_counts();
            assert!(counts.0 <= previous.0 && counts.1 <= previous.1 && counts.2 <= previous.2);
            previous = counts;
        }
    }

    #[test]
    fn empty_reply_gets_sentinels() {
        let r = normalize(native(NativePayload::Json(json!({}))), &opts(0.7));
        assert_eq!(r.title, UNKNOWN_TITLE);
        assert_eq!(r.geometry.part_type, UNKNOWN);
        assert_eq!(r.manufacturing.primary_process, UNKNOWN);
        assert_eq!(r.metadata.confidence_score, DEFAULT_REPLY_CONFIDENCE);
        assert_eq!(r.geometry.complexity_score, 0.0);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json["material"].is_null());
    }

    #[test]
    fn raw_response_is_opt_in() {
        let mut o = opts(0.7);
        o.include_raw = true;
        let r = normalize(native(NativePayload::Json(reply())), &o);
        assert_eq!(r.raw_response.unwrap()["title"], "Mounting bracket");
    }

    fn fragments(insights: Option<Value>) -> FragmentSet {
        let mut set = FragmentSet::default();
        set.insert(
            FragmentKind::Metadata,
            json!({"designation": "Flange DN50", "drawing_number": "F-100", "revision": "C"}),
        );
        let dims: Vec<Value> = (1..=7)
            .map(|i| json!({"label": format!("d{i}"), "value": i as f64 * 10.0}))
            .collect();
        set.insert(
            FragmentKind::Features,
            json!({
                "dimensions": dims,
                "tolerances": [{"type": "geometric", "value": "◎ 0.02", "confidence": 0.4}],
                "features": [{"type": "hole", "quantity": 8}]
            }),
        );
        if let Some(i) = insights {
            set.insert(FragmentKind::Insights, i);
        }
        set.completed = true;
        set
    }

    #[test]
    fn fragments_are_mapped() {
        let mut n = native(NativePayload::Extraction(fragments(Some(json!({
            "manufacturing_methods": ["Turning", "Drilling", "Grinding"]
        })))));
        n.provider = ProviderId::StructuredExtraction;
        n.tokens_used = None;
        let r = normalize(n, &opts(0.7));

        assert_eq!(r.title, "Flange DN50");
        assert_eq!(r.revision.as_deref(), Some("C"));
        assert_eq!(r.geometry.overall_dimensions.len(), 7);
        assert_eq!(r.quality.critical_dimensions, ["d1", "d2", "d3", "d4", "d5"]);
        assert!(r.quality.tolerances.is_empty());
        assert_eq!(r.manufacturing.primary_process, "Turning");
        assert_eq!(r.manufacturing.secondary_processes, ["Drilling", "Grinding"]);
        assert_eq!(r.metadata.confidence_score, DEFAULT_EXTRACTION_CONFIDENCE);
        assert!(r.general_notes.contains(&"Detected 7 dimensions".to_string()));
        assert!(r.general_notes.contains(&"Identified 1 special features".to_string()));
        assert_eq!(r.geometry.complexity_score, complexity_score(7, 1, 0));
    }

    #[test]
    fn repeated_dimension_labels_are_all_kept() {
        let mut set = FragmentSet::default();
        set.insert(
            FragmentKind::Features,
            json!({"dimensions": [
                {"label": "Ø10", "value": 10.0},
                {"label": "Ø10", "value": 10.0, "location": "flange"},
                {"label": "Ø10", "value": 10.0, "location": "hub"}
            ]}),
        );
        let r = normalize(native(NativePayload::Extraction(set)), &opts(0.7));

        let labels: Vec<&str> = r.geometry.overall_dimensions.keys().map(|s| s.as_str()).collect();
        assert_eq!(labels, ["Ø10", "Ø10_2", "Ø10_3"]);
        assert_eq!(r.geometry.overall_dimensions["Ø10_3"].location.as_deref(), Some("hub"));
        assert!(r.general_notes.contains(&"Detected 3 dimensions".to_string()));
        assert_eq!(r.geometry.complexity_score, complexity_score(3, 0, 0));
    }

    #[test]
    fn non_finite_dimensions_are_ignored() {
        let reply = json!({"geometry": {"overall_dimensions": {
            "len": {"value": "NaN"},
            "w": "inf",
            "h": "-inf",
            "d": 12.5
        }}});
        let r = normalize(native(NativePayload::Json(reply)), &opts(0.7));

        let labels: Vec<&str> = r.geometry.overall_dimensions.keys().map(|s| s.as_str()).collect();
        assert_eq!(labels, ["d"]);
        assert_eq!(
            r.metadata.warnings.iter().filter(|w| w.contains("no numeric value")).count(),
            3
        );

        // Survives a save/reload and compares equal to itself.
        let text = serde_json::to_string(&r).unwrap();
        let back: DrawingAnalysisResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.geometry.overall_dimensions, r.geometry.overall_dimensions);
        assert!(crate::compare::compare(&r, &r).dimensions.iter().all(|d| d.matched));
    }

    #[test]
    fn non_finite_confidence_counts_as_zero() {
        let reply = json!({
            "geometry": {"overall_dimensions": {"len": {"value": 5, "confidence": "NaN"}}},
            "confidence_score": "NaN"
        });
        let r = normalize(native(NativePayload::Json(reply)), &opts(0.7));
        assert!(r.geometry.overall_dimensions.is_empty());
        assert_eq!(r.metadata.confidence_score, 0.0);
    }

    #[test]
    fn insights_without_methods_default_primary() {
        let r = normalize(
            native(NativePayload::Extraction(fragments(Some(json!({}))))),
            &opts(0.7),
        );
        assert_eq!(r.manufacturing.primary_process, DEFAULT_PRIMARY_PROCESS);
        assert_eq!(r.manufacturing.difficulty_level, Difficulty::Medium);
    }

    #[test]
    fn missing_insights_leave_sentinels() {
        let r = normalize(native(NativePayload::Extraction(fragments(None))), &opts(0.7));
        assert_eq!(r.manufacturing.primary_process, UNKNOWN);
        assert_eq!(r.manufacturing.difficulty_level, Difficulty::Unknown);
    }

    #[test]
    fn extraction_title_falls_back_to_filename() {
        let r = normalize(
            native(NativePayload::Extraction(FragmentSet::default())),
            &opts(0.7),
        );
        assert_eq!(r.title, "bracket.png");
        assert!(r.revision.is_none());
    }

    #[test]
    fn failure_result_is_minimal() {
        let err = DrawingError::InvalidJson {
            provider: "vision-chat".into(),
            detail: "expected value at line 1".into(),
        };
        let r = normalize_failure(
            ProviderId::VisionChat,
            "gpt-4.1",
            Duration::from_secs(3),
            &err,
            "bracket.png",
        );
        assert_eq!(r.metadata.confidence_score, 0.0);
        assert_eq!(r.metadata.processing_time, 3.0);
        assert_eq!(r.geometry.complexity_score, 0.0);
        assert_eq!(r.manufacturing.setup_count, 1);
        assert!(r.metadata.warnings[0].starts_with("Analysis failed: [AnalysisError]"));
        assert!(r.is_failure());
    }
}
