//! Instruction templates for the free-text providers.
//!
//! Both the vision-chat and reasoning-effort adapters send the same system
//! prompt and the same JSON skeleton; only the depth paragraph differs. The
//! skeleton's keys are the ones [`crate::pipeline::normalize`] reads, so a
//! change here usually needs a matching change there.

use crate::config::ReasoningDepth;

/// System prompt: role and hard output rules.
pub const SYSTEM_PROMPT: &str = r#"You are a manufacturing engineer with twenty years of CNC experience, reading 2D technical drawings.

Rules:
1. Read every dimension, tolerance, surface-finish symbol and title-block field visible on the sheet.
2. Report numbers with units ({"value": 120, "unit": "mm", "tolerance": "±0.1"}), never bare strings like "120".
3. Report features with their sizes and counts ({"type": "hole", "diameter": 6.5, "quantity": 4, "position": "Ø100 PCD"}).
4. Give every dimension, feature and tolerance a "confidence" between 0 and 1.
5. If a value is not on the drawing, use null. Do not guess.
6. Reply with ONE JSON object only. No prose, no markdown outside the object."#;

/// JSON skeleton the reply must follow.
pub const RESPONSE_SCHEMA: &str = r#"{
  "title": "part name or drawing title",
  "drawing_number": "drawing number or null",
  "revision": "revision letter or null",
  "scale": "1:1, 1:2, … or null",
  "material": {"name": "e.g. S235JR, AlMg3", "standard": "DIN/ASTM/ISO or null", "density": 7.85, "hardness": "or null"},
  "surface_finish": {"type": "anodize|paint|coating|plating|none", "description": "…", "roughness": "Ra value or null", "color": "or null"},
  "geometry": {
    "part_type": "flange, bracket, shaft, housing, …",
    "shape_type": "cylindrical, prismatic, L-profile, complex",
    "overall_dimensions": {
      "length": {"value": 120.0, "unit": "mm", "tolerance": "±0.2", "location": "front view", "confidence": 0.95}
    },
    "features": [
      {"type": "hole|pocket|slot|groove|thread|fillet|chamfer", "quantity": 4, "dimensions": {"diameter": 6.5, "depth": 15}, "position": "…", "notes": "…", "confidence": 0.9}
    ]
  },
  "manufacturing": {
    "primary_process": "CNC milling|CNC turning|pressing|welding",
    "secondary_processes": ["drilling", "tapping"],
    "setup_count": 2,
    "estimated_operations": ["1. stock preparation", "2. contour milling"],
    "difficulty_level": "easy|medium|hard",
    "special_requirements": ["…"]
  },
  "quality": {
    "tolerances": [{"type": "dimensional|geometric|surface", "value": "⊥ 0.05 A", "reference": "A", "confidence": 0.9}],
    "surface_finishes": [{"type": "…", "description": "…", "roughness": "Ra 1.6"}],
    "inspection_notes": ["…"],
    "critical_dimensions": ["length"]
  },
  "general_notes": ["…"],
  "design_recommendations": ["…"],
  "confidence_score": 0.85
}"#;

/// Paragraph telling the model how hard to look.
pub fn depth_instruction(depth: ReasoningDepth) -> &'static str {
    match depth {
        ReasoningDepth::XHigh => {
            "Analyse exhaustively. Cross-check every view against the others, resolve every GD&T frame \
             and datum reference, and verify that the dimension chain closes before answering."
        }
        ReasoningDepth::High => {
            "Analyse carefully. Read all views, all GD&T frames and the title block, and check that \
             dimensions are consistent between views."
        }
        ReasoningDepth::Medium => {
            "Analyse the main views and the title block. Focus on overall dimensions, material and the \
             primary manufacturing process."
        }
    }
}

/// User-turn text sent alongside the page image.
pub fn user_prompt(depth: ReasoningDepth) -> String {
    format!(
        "{}\n\nReturn the analysis of this technical drawing as JSON in exactly this shape:\n{}",
        depth_instruction(depth),
        RESPONSE_SCHEMA
    )
}
