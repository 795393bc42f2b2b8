//! # edgequake-drawing
//!
//! Analyse 2D engineering drawings (PDF, PNG, JPEG) with interchangeable
//! analysis backends and normalise what they return into one comparable
//! schema.
//!
//! The crate does not interpret geometry itself. It shapes the drawing for
//! the backend (decode, enhance, encode) and shapes the backend's answer into
//! a [`DrawingAnalysisResult`].
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / image bytes
//!  │
//!  ├─ 1. Input      size / extension / emptiness checks
//!  ├─ 2. Render     PDF via pdfium, images via `image` (spawn_blocking)
//!  ├─ 3. Enhance    denoise → CLAHE → sharpen (by profile)
//!  ├─ 4. Encode     PNG → base64
//!  ├─ 5. Provider   vision-chat | reasoning-effort | structured-extraction
//!  ├─ 6. Normalize  confidence filter, complexity score, sentinels
//!  └─ 7. Compare    optional, two providers side by side
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_drawing::{analyze, AnalysisConfig, AnalysisContext, AnalysisRequest,
//!     ProviderId, ProviderSettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = AnalysisContext::from_settings(AnalysisConfig::default(), &ProviderSettings::from_env());
//!     let bytes = std::fs::read("bracket.pdf")?;
//!     let request = AnalysisRequest::new(ProviderId::ReasoningEffort, "bracket.pdf", bytes);
//!     let result = analyze(&ctx, &request).await?;
//!     println!("{}: complexity {}", result.title, result.geometry.complexity_score);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `drawing-analyzer` binary (clap + anyhow + tracing-subscriber) |
//!
//! ## Providers
//!
//! | Id | Backend | Credentials |
//! |----|---------|-------------|
//! | `vision-chat` | any `edgequake-llm` chat provider | `OPENAI_API_KEY` / `ANTHROPIC_API_KEY` / `GEMINI_API_KEY` |
//! | `reasoning-effort` | OpenAI Responses API with `reasoning.effort` | `OPENAI_API_KEY` |
//! | `structured-extraction` | NDJSON extraction service | `W24TECHREAD_AUTH_TOKEN`, `DRAWING_EXTRACTION_ENDPOINT` |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analyze;
pub mod compare;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod providers;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analyze::{analyze, compare, AnalysisContext, AnalysisRequest};
pub use compare::{ComparisonOutcome, ComparisonReport, Side};
pub use config::{
    AnalysisConfig, AnalysisConfigBuilder, EnhancementProfile, ProviderId, ProviderSettings,
    ReasoningDepth,
};
pub use error::{DrawingError, ErrorKind, ErrorReport};
pub use output::DrawingAnalysisResult;
pub use progress::{AnalysisProgressCallback, NoopProgressCallback, ProgressCallback};
pub use providers::{ProviderAdapter, ProviderNativeResult};
