//! Provider adapters: one implementation per backend family.
//!
//! ```text
//!                       ┌─ VisionChatAdapter        (edgequake-llm chat)
//! ProviderAdapter ──────┼─ ReasoningEffortAdapter   (responses API + effort)
//!                       └─ StructuredExtractionAdapter (typed fragments)
//! ```
//!
//! The orchestrator picks an adapter by [`ProviderId`] from the registry in
//! [`crate::analyze::AnalysisContext`]; adding a backend means implementing
//! [`ProviderAdapter`] and registering it, never another `match` arm in the
//! orchestration code.
//!
//! Adapters return [`ProviderNativeResult`]; mapping onto the canonical
//! schema is [`crate::pipeline::normalize`]'s job.

pub mod chat;
pub mod extraction;
pub mod reasoning;

use crate::config::{AnalysisConfig, ProviderId, ReasoningDepth};
use crate::error::DrawingError;
use crate::pipeline::encode::EncodedPage;
use crate::pipeline::input::RawDrawing;
use async_trait::async_trait;
use extraction::FragmentSet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::time::Duration;

pub use chat::VisionChatAdapter;
pub use extraction::{ExtractionClient, HttpExtractionClient, StructuredExtractionAdapter};
pub use reasoning::ReasoningEffortAdapter;

/// What an adapter consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// The enhanced, encoded page.
    EnhancedPage,
    /// The original upload; the backend does its own reading.
    RawDrawing,
}

/// Input handed to [`ProviderAdapter::analyze`].
#[derive(Debug, Clone, Copy)]
pub enum AdapterInput<'a> {
    Page(&'a EncodedPage),
    Raw(&'a RawDrawing),
}

/// Per-call analysis parameters.
#[derive(Debug, Clone)]
pub struct AnalysisParams {
    pub reasoning: ReasoningDepth,
    pub temperature: f32,
    pub max_tokens: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub extraction_timeout: Duration,
    pub extraction_grace: Duration,
}

impl AnalysisParams {
    pub fn from_config(config: &AnalysisConfig, reasoning: ReasoningDepth) -> Self {
        Self {
            reasoning,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            extraction_timeout: config.extraction_timeout(),
            extraction_grace: config.extraction_grace(),
        }
    }
}

/// Backend-native output, before normalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum NativePayload {
    /// One JSON object parsed from a free-text reply.
    Json(Value),
    /// Typed fragments from a structured-extraction backend.
    Extraction(FragmentSet),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderNativeResult {
    pub provider: ProviderId,
    pub model: String,
    pub payload: NativePayload,
    pub tokens_used: Option<u64>,
    /// Wall-clock time of the backend call, always reported.
    pub elapsed: Duration,
    /// Non-fatal conditions (partial data, backend-side errors).
    pub warnings: Vec<String>,
}

/// A backend capable of analysing one drawing.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Model or service name reported in result metadata.
    fn model(&self) -> &str;

    fn input_kind(&self) -> InputKind {
        InputKind::EnhancedPage
    }

    async fn analyze(
        &self,
        input: AdapterInput<'_>,
        params: &AnalysisParams,
    ) -> Result<ProviderNativeResult, DrawingError>;
}

// ── Shared helpers ───────────────────────────────────────────────────────

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:json|JSON)?\s*\n?(.*?)\n?\s*```$").unwrap());

/// Parse a free-text reply that must be exactly one JSON object, optionally
/// inside a single ```` ```json ```` fence.
pub fn parse_json_reply(provider: ProviderId, reply: &str) -> Result<Value, DrawingError> {
    let trimmed = reply.trim();
    let body = FENCED_JSON
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let value: Value = serde_json::from_str(body).map_err(|e| DrawingError::InvalidJson {
        provider: provider.to_string(),
        detail: e.to_string(),
    })?;

    if value.is_object() {
        Ok(value)
    } else {
        Err(DrawingError::InvalidJson {
            provider: provider.to_string(),
            detail: "reply is valid JSON but not an object".into(),
        })
    }
}

/// Exponential backoff delay before retry `attempt` (1-based).
pub(crate) fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1))))
}

/// Upper bound on any single wait between attempts, including a
/// server-supplied `Retry-After`.
pub(crate) fn max_backoff(base_ms: u64, max_retries: u32) -> Duration {
    backoff_delay(base_ms, max_retries.saturating_add(1))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_object_parses() {
        let v = parse_json_reply(ProviderId::VisionChat, " {\"title\": \"A\"} ").unwrap();
        assert_eq!(v["title"], "A");
    }

    #[test]
    fn fenced_object_parses() {
        let reply = "```json\n{\"title\": \"Shaft\"}\n```";
        let v = parse_json_reply(ProviderId::VisionChat, reply).unwrap();
        assert_eq!(v["title"], "Shaft");

        let bare = "```\n{\"a\": 1}\n```";
        assert_eq!(parse_json_reply(ProviderId::VisionChat, bare).unwrap()["a"], 1);
    }

    #[test]
    fn prose_is_rejected() {
        let err = parse_json_reply(ProviderId::ReasoningEffort, "Here is the analysis: {}")
            .unwrap_err();
        assert!(matches!(err, DrawingError::InvalidJson { .. }));
        assert!(err.is_provider_failure());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(parse_json_reply(ProviderId::VisionChat, "[1, 2]").is_err());
        assert!(parse_json_reply(ProviderId::VisionChat, "").is_err());
    }

    #[test]
    fn backoff_doubles() {
        assert_eq!(backoff_delay(500, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(500, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(500, 3), Duration::from_millis(2000));
    }

    #[test]
    fn max_backoff_is_one_step_past_the_last_retry() {
        assert_eq!(max_backoff(500, 2), Duration::from_millis(2000));
        assert_eq!(max_backoff(500, 0), Duration::from_millis(500));
        assert_eq!(max_backoff(u64::MAX, u32::MAX), Duration::from_millis(u64::MAX));
    }
}
