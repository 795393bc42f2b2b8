//! Canonical analysis schema.
//!
//! Every provider's native output is normalised into a
//! [`DrawingAnalysisResult`]. The schema is always fully populated when
//! serialised: optional values render as `null`, containers as `[]`/`{}`,
//! and unresolved classifications as the `"Unknown"`/`"unknown"` sentinels.
//! No field carries `skip_serializing_if`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Title used when the drawing carries none (or analysis failed).
pub const UNKNOWN_TITLE: &str = "Unknown";
/// Classification sentinel for part/shape type and processes.
pub const UNKNOWN: &str = "unknown";

/// One labelled dimension, e.g. `"overall_length" → 120 mm ±0.1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionInfo {
    pub value: f64,
    pub unit: String,
    pub tolerance: Option<String>,
    pub location: Option<String>,
}

impl Default for DimensionInfo {
    fn default() -> Self {
        Self {
            value: 0.0,
            unit: "mm".to_string(),
            tolerance: None,
            location: None,
        }
    }
}

/// A machined feature: hole, pocket, slot, groove, fillet, chamfer, …
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub quantity: u32,
    pub dimensions: IndexMap<String, Value>,
    pub position: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialInfo {
    pub name: String,
    pub standard: Option<String>,
    pub density: Option<f64>,
    pub hardness: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceFinishInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub roughness: Option<String>,
    pub color: Option<String>,
}

/// Dimensional, geometric or surface tolerance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToleranceInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryAnalysis {
    pub part_type: String,
    pub shape_type: String,
    /// Dimension label → value, in the order the provider reported them.
    pub overall_dimensions: IndexMap<String, DimensionInfo>,
    pub features: Vec<FeatureInfo>,
    /// Derived richness metric in [0, 10].
    pub complexity_score: f64,
}

impl Default for GeometryAnalysis {
    fn default() -> Self {
        Self {
            part_type: UNKNOWN.to_string(),
            shape_type: UNKNOWN.to_string(),
            overall_dimensions: IndexMap::new(),
            features: Vec::new(),
            complexity_score: 0.0,
        }
    }
}

/// Manufacturing difficulty tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    #[default]
    Unknown,
}

impl Difficulty {
    /// Parse a provider's free-text tier. Accepts English and Turkish terms.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "easy" | "simple" | "low" | "kolay" => Difficulty::Easy,
            "medium" | "moderate" | "orta" => Difficulty::Medium,
            "hard" | "difficult" | "high" | "complex" | "zor" => Difficulty::Hard,
            _ => Difficulty::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
            Difficulty::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManufacturingAnalysis {
    pub primary_process: String,
    pub secondary_processes: Vec<String>,
    /// Always ≥ 1.
    pub setup_count: u32,
    pub estimated_operations: Vec<String>,
    pub difficulty_level: Difficulty,
    pub special_requirements: Vec<String>,
}

impl Default for ManufacturingAnalysis {
    fn default() -> Self {
        Self {
            primary_process: UNKNOWN.to_string(),
            secondary_processes: Vec::new(),
            setup_count: 1,
            estimated_operations: Vec::new(),
            difficulty_level: Difficulty::Unknown,
            special_requirements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityRequirements {
    pub tolerances: Vec<ToleranceInfo>,
    pub surface_finishes: Vec<SurfaceFinishInfo>,
    pub inspection_notes: Vec<String>,
    /// Labels into [`GeometryAnalysis::overall_dimensions`] (not enforced).
    pub critical_dimensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetadata {
    /// Provider family that produced the result (`vision-chat`, …).
    pub provider: String,
    pub model_used: String,
    /// Wall-clock seconds spent in the provider call.
    pub processing_time: f64,
    /// Overall confidence in [0, 1].
    pub confidence_score: f64,
    pub tokens_used: Option<u64>,
    pub warnings: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// The canonical result every provider normalises into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingAnalysisResult {
    pub title: String,
    pub revision: Option<String>,
    pub drawing_number: Option<String>,
    pub scale: Option<String>,

    pub material: Option<MaterialInfo>,
    pub surface_finish: Option<SurfaceFinishInfo>,

    pub geometry: GeometryAnalysis,
    pub manufacturing: ManufacturingAnalysis,
    pub quality: QualityRequirements,

    pub general_notes: Vec<String>,
    pub design_recommendations: Vec<String>,

    pub metadata: AnalysisMetadata,

    /// Provider-native payload, attached only when diagnostics are requested.
    pub raw_response: Option<Value>,
}

impl DrawingAnalysisResult {
    /// Number of dimensions, features and tolerances, in that order.
    pub fn item_counts(&self) -> (usize, usize, usize) {
        (
            self.geometry.overall_dimensions.len(),
            self.geometry.features.len(),
            self.quality.tolerances.len(),
        )
    }

    /// True when this is the synthesized result of a failed provider call.
    pub fn is_failure(&self) -> bool {
        self.metadata.confidence_score == 0.0
            && self
                .metadata
                .warnings
                .iter()
                .any(|w| w.starts_with("Analysis failed"))
    }
}
