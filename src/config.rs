//! Configuration types for drawing analysis.
//!
//! Process-wide knobs live in [`AnalysisConfig`], built via its
//! [`AnalysisConfigBuilder`]. Per-request choices (provider, enhancement
//! profile, reasoning depth, confidence threshold) travel in
//! [`crate::analyze::AnalysisRequest`] instead, because two concurrent
//! requests may legitimately pick different ones.
//!
//! Credentials and endpoints are read once into [`ProviderSettings`] and
//! handed to [`crate::analyze::AnalysisContext`]; nothing downstream reads
//! the environment.

use crate::error::DrawingError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Configuration shared by every analysis a context runs.
///
/// # Example
/// ```rust
/// use edgequake_drawing::AnalysisConfig;
///
/// let config = AnalysisConfig::builder()
///     .dpi(300)
///     .max_retries(1)
///     .build()
///     .unwrap();
/// assert_eq!(config.dpi, 300);
/// ```
#[derive(Clone)]
pub struct AnalysisConfig {
    /// Rendering DPI for PDF sheets. Range: 72–600. Default: 400.
    ///
    /// High enough to resolve dimension text and thin tolerance-frame lines,
    /// bounded so the vision payload stays well under upload limits.
    pub dpi: u32,

    /// Maximum rendered image dimension (width or height) in pixels. Default: 4096.
    ///
    /// An A0 sheet at 400 DPI is roughly 13 000 × 18 700 px; the cap scales
    /// it down proportionally before it reaches the enhancement stage.
    pub max_rendered_pixels: u32,

    /// Upload size ceiling in bytes. Default: 20 MiB.
    pub max_input_bytes: usize,

    /// Sampling temperature for the chat provider. Default: 0.1.
    pub temperature: f32,

    /// Maximum output tokens per provider call. Default: 16384.
    pub max_tokens: usize,

    /// Retry attempts on a transient provider failure. Default: 2.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds (exponential backoff). Default: 500.
    pub retry_backoff_ms: u64,

    /// Wall-clock budget for one provider call in seconds. Default: 600.
    ///
    /// Deep reasoning runs take minutes; the timeout only guards against a
    /// backend that never answers.
    pub api_timeout_secs: u64,

    /// Bounded wait for the structured-extraction completion signal. Default: 120.
    pub extraction_timeout_secs: u64,

    /// How long to keep collecting fragments after completion. Default: 500.
    pub extraction_grace_ms: u64,

    /// Attach the provider-native payload to the canonical result. Default: false.
    pub include_raw_response: bool,

    /// Optional stage-progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            dpi: 400,
            max_rendered_pixels: 4096,
            max_input_bytes: 20 * 1024 * 1024,
            temperature: 0.1,
            max_tokens: 16384,
            max_retries: 2,
            retry_backoff_ms: 500,
            api_timeout_secs: 600,
            extraction_timeout_secs: 120,
            extraction_grace_ms: 500,
            include_raw_response: false,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for AnalysisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("max_input_bytes", &self.max_input_bytes)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("extraction_timeout_secs", &self.extraction_timeout_secs)
            .field("extraction_grace_ms", &self.extraction_grace_ms)
            .field("include_raw_response", &self.include_raw_response)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn AnalysisProgressCallback>"),
            )
            .finish()
    }
}

impl AnalysisConfig {
    /// Create a new builder for `AnalysisConfig`.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    pub fn extraction_grace(&self) -> Duration {
        Duration::from_millis(self.extraction_grace_ms)
    }
}

/// Builder for [`AnalysisConfig`].
#[derive(Debug)]
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 600);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn max_input_bytes(mut self, bytes: usize) -> Self {
        self.config.max_input_bytes = bytes;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn extraction_timeout_secs(mut self, secs: u64) -> Self {
        self.config.extraction_timeout_secs = secs;
        self
    }

    pub fn extraction_grace_ms(mut self, ms: u64) -> Self {
        self.config.extraction_grace_ms = ms;
        self
    }

    pub fn include_raw_response(mut self, v: bool) -> Self {
        self.config.include_raw_response = v;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<AnalysisConfig, DrawingError> {
        let c = &self.config;
        if c.max_input_bytes == 0 {
            return Err(DrawingError::InvalidConfig(
                "max_input_bytes must be ≥ 1".into(),
            ));
        }
        if c.max_tokens == 0 {
            return Err(DrawingError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 || c.extraction_timeout_secs == 0 {
            return Err(DrawingError::InvalidConfig(
                "timeouts must be at least one second".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Named preset controlling the sharpening stage of the enhancement engine.
///
/// | Profile | Sharpen stage | Use case |
/// |---------|---------------|----------|
/// | `fast` | none | latency-sensitive, clean CAD exports |
/// | `balanced` | unsharp mask 1.5 / −0.5, σ = 3 | default |
/// | `aggressive` | 3×3 high-pass kernel | otherwise-illegible scans |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementProfile {
    Fast,
    #[default]
    Balanced,
    Aggressive,
}

impl EnhancementProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancementProfile::Fast => "fast",
            EnhancementProfile::Balanced => "balanced",
            EnhancementProfile::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for EnhancementProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnhancementProfile {
    type Err = DrawingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(DrawingError::InvalidConfig(format!(
                "unknown enhancement profile '{other}' (expected fast, balanced or aggressive)"
            ))),
        }
    }
}

/// Reasoning-depth hint, mapped 1:1 onto the reasoning backend's effort control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningDepth {
    Medium,
    #[default]
    High,
    XHigh,
}

impl ReasoningDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningDepth::Medium => "medium",
            ReasoningDepth::High => "high",
            ReasoningDepth::XHigh => "xhigh",
        }
    }
}

impl fmt::Display for ReasoningDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasoningDepth {
    type Err = DrawingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "xhigh" => Ok(Self::XHigh),
            other => Err(DrawingError::InvalidConfig(format!(
                "unknown reasoning depth '{other}' (expected medium, high or xhigh)"
            ))),
        }
    }
}

/// Which backend family analyses the drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderId {
    /// Vision chat completion: one page + instructions → one JSON object.
    VisionChat,
    /// Same contract plus a reasoning-depth control.
    ReasoningEffort,
    /// Typed extraction requests answered by asynchronous fragments.
    StructuredExtraction,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::VisionChat,
        ProviderId::ReasoningEffort,
        ProviderId::StructuredExtraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::VisionChat => "vision-chat",
            ProviderId::ReasoningEffort => "reasoning-effort",
            ProviderId::StructuredExtraction => "structured-extraction",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = DrawingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vision-chat" | "chat" => Ok(Self::VisionChat),
            "reasoning-effort" | "reasoning" => Ok(Self::ReasoningEffort),
            "structured-extraction" | "extraction" => Ok(Self::StructuredExtraction),
            other => Err(DrawingError::InvalidConfig(format!(
                "unknown provider '{other}' (expected vision-chat, reasoning-effort or structured-extraction)"
            ))),
        }
    }
}

// ── Provider settings ────────────────────────────────────────────────────

/// Credentials and endpoints for the three backend families.
///
/// Read once per process by [`ProviderSettings::from_env`]; every field is
/// optional so that a context can be built with only some providers
/// available. A missing credential surfaces as
/// [`DrawingError::ProviderNotConfigured`] when that provider is selected.
#[derive(Clone, Default)]
pub struct ProviderSettings {
    /// Chat backend name understood by `edgequake_llm::ProviderFactory`.
    pub chat_provider: String,
    pub chat_model: String,
    pub reasoning_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub openai_base_url: String,
    pub extraction_endpoint: Option<String>,
    pub extraction_token: Option<String>,
    pub extraction_region: Option<String>,
}

pub const DEFAULT_CHAT_PROVIDER: &str = "openai";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4.1";
pub const DEFAULT_REASONING_MODEL: &str = "gpt-5.2";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

impl ProviderSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through an arbitrary lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            chat_provider: get("DRAWING_CHAT_PROVIDER")
                .unwrap_or_else(|| DEFAULT_CHAT_PROVIDER.to_string()),
            chat_model: get("DRAWING_CHAT_MODEL").unwrap_or_else(|| DEFAULT_CHAT_MODEL.to_string()),
            reasoning_model: get("DRAWING_REASONING_MODEL")
                .unwrap_or_else(|| DEFAULT_REASONING_MODEL.to_string()),
            openai_api_key: get("OPENAI_API_KEY"),
            anthropic_api_key: get("ANTHROPIC_API_KEY"),
            gemini_api_key: get("GEMINI_API_KEY"),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            extraction_endpoint: get("DRAWING_EXTRACTION_ENDPOINT"),
            extraction_token: get("W24TECHREAD_AUTH_TOKEN"),
            extraction_region: get("W24TECHREAD_AUTH_REGION"),
        }
    }

    /// The API key the configured chat backend needs, or `Ok(None)` for
    /// keyless local backends.
    ///
    /// Returns an error naming the missing variable when a keyed backend has
    /// no key, so the caller can fail before building any client.
    pub fn chat_credential(&self) -> Result<Option<&str>, DrawingError> {
        let (var, key) = match self.chat_provider.as_str() {
            "openai" => ("OPENAI_API_KEY", &self.openai_api_key),
            "anthropic" => ("ANTHROPIC_API_KEY", &self.anthropic_api_key),
            "gemini" => ("GEMINI_API_KEY", &self.gemini_api_key),
            _ => return Ok(None),
        };
        key.as_deref().map(Some).ok_or_else(|| DrawingError::ProviderNotConfigured {
            provider: ProviderId::VisionChat.to_string(),
            hint: format!("Set {var} to use the '{}' chat backend.", self.chat_provider),
        })
    }
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |v: &Option<String>| v.as_ref().map(|_| "<set>");
        f.debug_struct("ProviderSettings")
            .field("chat_provider", &self.chat_provider)
            .field("chat_model", &self.chat_model)
            .field("reasoning_model", &self.reasoning_model)
            .field("openai_api_key", &mask(&self.openai_api_key))
            .field("anthropic_api_key", &mask(&self.anthropic_api_key))
            .field("gemini_api_key", &mask(&self.gemini_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("extraction_endpoint", &self.extraction_endpoint)
            .field("extraction_token", &mask(&self.extraction_token))
            .field("extraction_region", &self.extraction_region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn builder_clamps_dpi() {
        let config = AnalysisConfig::builder().dpi(10).build().unwrap();
        assert_eq!(config.dpi, 72);
        let config = AnalysisConfig::builder().dpi(1200).build().unwrap();
        assert_eq!(config.dpi, 600);
    }

    #[test]
    fn builder_rejects_zero_ceiling() {
        let err = AnalysisConfig::builder().max_input_bytes(0).build().unwrap_err();
        assert!(matches!(err, DrawingError::InvalidConfig(_)));
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = AnalysisConfig::default();
        assert_eq!(c.dpi, 400);
        assert_eq!(c.max_input_bytes, 20 * 1024 * 1024);
        assert_eq!(c.extraction_grace(), Duration::from_millis(500));
    }

    #[test]
    fn parse_enums() {
        assert_eq!("Aggressive".parse::<EnhancementProfile>().unwrap(), EnhancementProfile::Aggressive);
        assert_eq!("xhigh".parse::<ReasoningDepth>().unwrap(), ReasoningDepth::XHigh);
        assert_eq!("chat".parse::<ProviderId>().unwrap(), ProviderId::VisionChat);
        assert_eq!(
            "structured-extraction".parse::<ProviderId>().unwrap(),
            ProviderId::StructuredExtraction
        );
        assert!("low".parse::<ReasoningDepth>().is_err());
        assert!("gpt-5.2".parse::<ProviderId>().is_err());
    }

    #[test]
    fn provider_id_display_round_trips() {
        for id in ProviderId::ALL {
            assert_eq!(id.to_string().parse::<ProviderId>().unwrap(), id);
            let json = serde_json::to_value(id).unwrap();
            assert_eq!(json.as_str().unwrap(), id.as_str());
        }
    }

    #[test]
    fn settings_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-test"),
            ("DRAWING_CHAT_MODEL", "gpt-4o"),
            ("W24TECHREAD_AUTH_TOKEN", " "),
        ]
        .into_iter()
        .collect();
        let s = ProviderSettings::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.chat_provider, "openai");
        assert_eq!(s.chat_model, "gpt-4o");
        assert_eq!(s.openai_api_key.as_deref(), Some("sk-test"));
        assert!(s.extraction_token.is_none(), "blank values count as unset");
        assert_eq!(s.chat_credential().unwrap(), Some("sk-test"));
    }

    #[test]
    fn missing_chat_key_is_credential_error() {
        let s = ProviderSettings::from_lookup(|k| {
            (k == "DRAWING_CHAT_PROVIDER").then(|| "anthropic".to_string())
        });
        let err = s.chat_credential().unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn keyless_backend_needs_no_credential() {
        let s = ProviderSettings::from_lookup(|k| {
            (k == "DRAWING_CHAT_PROVIDER").then(|| "ollama".to_string())
        });
        assert_eq!(s.chat_credential().unwrap(), None);
    }

    #[test]
    fn debug_masks_secrets() {
        let s = ProviderSettings::from_lookup(|k| (k == "OPENAI_API_KEY").then(|| "sk-secret".into()));
        let dbg = format!("{s:?}");
        assert!(!dbg.contains("sk-secret"));
    }
}
