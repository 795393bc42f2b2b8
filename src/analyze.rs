//! Orchestration entry points.
//!
//! ```text
//! AnalysisRequest
//!   │ 1. ingress validation        (RawDrawing::from_upload)
//!   │ 2. adapter lookup            (AnalysisContext registry)
//!   │ 3. decode → enhance → encode (page-based adapters only)
//!   │ 4. adapter.analyze           (bounded by api_timeout)
//!   ▼ 5. normalize / normalize_failure
//! DrawingAnalysisResult
//! ```
//!
//! Steps 1–3 fail fast with `Err`, before any network call. From step 4 on,
//! every failure becomes a minimal canonical result, so the caller always
//! receives a well-formed record.
//!
//! [`compare`] runs two providers concurrently over one preprocessed page.
//! Each side fails independently; a side whose provider is not configured
//! also degrades to a minimal result instead of aborting the comparison.

use crate::compare::ComparisonOutcome;
use crate::config::{AnalysisConfig, EnhancementProfile, ProviderId, ProviderSettings, ReasoningDepth};
use crate::error::DrawingError;
use crate::output::{DrawingAnalysisResult, UNKNOWN};
use crate::pipeline::encode::{encode, EncodedPage};
use crate::pipeline::enhance::{enhance, enhance_page};
use crate::pipeline::input::RawDrawing;
use crate::pipeline::normalize::{normalize, normalize_failure, NormalizeOptions};
use crate::pipeline::render::{decode_page, decode_pages, Page};
use crate::providers::{
    AdapterInput, AnalysisParams, InputKind, ProviderAdapter, ReasoningEffortAdapter,
    StructuredExtractionAdapter, VisionChatAdapter,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Threshold used when a request does not set one.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

// ── Context ──────────────────────────────────────────────────────────────

/// Process-wide analysis context: configuration plus the configured
/// provider adapters.
///
/// Build it once (usually with [`AnalysisContext::from_settings`]) and pass
/// it to [`analyze`] / [`compare`]. Tests inject stub adapters with
/// [`AnalysisContext::with_adapter`].
pub struct AnalysisContext {
    config: AnalysisConfig,
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    /// Why a provider is unavailable, reported on lookup.
    unavailable: HashMap<ProviderId, String>,
}

impl std::fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("config", &self.config)
            .field("providers", &self.providers())
            .finish()
    }
}

impl AnalysisContext {
    /// A context with no providers registered.
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            config,
            adapters: HashMap::new(),
            unavailable: HashMap::new(),
        }
    }

    /// Build every provider the settings allow. Providers whose credentials
    /// are missing are left out; selecting one later yields a
    /// [`DrawingError::ProviderNotConfigured`] carrying the setup hint.
    pub fn from_settings(config: AnalysisConfig, settings: &ProviderSettings) -> Self {
        let mut ctx = Self::new(config);

        let built: [(ProviderId, Result<Arc<dyn ProviderAdapter>, DrawingError>); 3] = [
            (
                ProviderId::VisionChat,
                VisionChatAdapter::from_settings(settings)
                    .map(|a| Arc::new(a) as Arc<dyn ProviderAdapter>),
            ),
            (
                ProviderId::ReasoningEffort,
                ReasoningEffortAdapter::from_settings(settings, &ctx.config)
                    .map(|a| Arc::new(a) as Arc<dyn ProviderAdapter>),
            ),
            (
                ProviderId::StructuredExtraction,
                StructuredExtractionAdapter::from_settings(settings, &ctx.config)
                    .map(|a| Arc::new(a) as Arc<dyn ProviderAdapter>),
            ),
        ];

        for (id, adapter) in built {
            match adapter {
                Ok(adapter) => ctx.register(adapter),
                Err(DrawingError::ProviderNotConfigured { hint, .. }) => {
                    debug!("Provider {} not configured: {}", id, hint);
                    ctx.unavailable.insert(id, hint);
                }
                Err(e) => {
                    warn!("Provider {} unavailable: {}", id, e);
                    ctx.unavailable.insert(id, e.to_string());
                }
            }
        }
        info!("Configured providers: {:?}", ctx.providers());
        ctx
    }

    /// Register (or replace) an adapter under its own id.
    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let id = adapter.id();
        self.unavailable.remove(&id);
        self.adapters.insert(id, adapter);
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    /// Look up the adapter for `id`.
    pub fn adapter(&self, id: ProviderId) -> Result<Arc<dyn ProviderAdapter>, DrawingError> {
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| DrawingError::ProviderNotConfigured {
                provider: id.to_string(),
                hint: self
                    .unavailable
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| "No adapter registered for this provider.".to_string()),
            })
    }

    /// Configured providers, in [`ProviderId::ALL`] order.
    pub fn providers(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|id| self.adapters.contains_key(id))
            .collect()
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }
}

// ── Request ──────────────────────────────────────────────────────────────

/// One drawing analysis request.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub provider: ProviderId,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub profile: EnhancementProfile,
    /// Consumed by the reasoning-effort provider and the prompt template.
    pub reasoning: ReasoningDepth,
    pub confidence_threshold: f64,
    /// 1-based sheet sent to page-based providers.
    pub page: usize,
}

impl AnalysisRequest {
    pub fn new(provider: ProviderId, filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            provider,
            filename: filename.into(),
            bytes,
            profile: EnhancementProfile::default(),
            reasoning: ReasoningDepth::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            page: 1,
        }
    }

    pub fn with_profile(mut self, profile: EnhancementProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_reasoning(mut self, reasoning: ReasoningDepth) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page;
        self
    }
}

// ── Preprocessing ────────────────────────────────────────────────────────

/// An enhanced, encoded page ready for a page-based provider.
#[derive(Debug, Clone)]
pub struct PreparedPage {
    pub encoded: EncodedPage,
    /// Page count of the source drawing.
    pub total_pages: usize,
}

/// Decode page `page` of the drawing, enhance it and encode it.
pub async fn preprocess(
    raw: &RawDrawing,
    profile: EnhancementProfile,
    page: usize,
    config: &AnalysisConfig,
) -> Result<PreparedPage, DrawingError> {
    if let Some(cb) = &config.progress_callback {
        cb.on_preprocess_start(&raw.filename, profile);
    }
    let started = Instant::now();

    let (decoded, total_pages) = decode_page(raw, config, page).await?;
    let encoded = enhance_and_encode(decoded, profile).await?;

    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        "Preprocessed '{}' page {}/{} ({} profile) → {}x{} in {}ms",
        raw.filename, page, total_pages, profile, encoded.width, encoded.height, elapsed_ms
    );
    if let Some(cb) = &config.progress_callback {
        cb.on_preprocess_complete(encoded.width, encoded.height, elapsed_ms);
    }
    Ok(PreparedPage {
        encoded,
        total_pages,
    })
}

/// Enhance and PNG-encode one page on the blocking pool; both are CPU-bound.
async fn enhance_and_encode(
    page: Page,
    profile: EnhancementProfile,
) -> Result<EncodedPage, DrawingError> {
    let index = page.index;
    tokio::task::spawn_blocking(move || enhance(page, profile).and_then(|p| encode(&p)))
        .await
        .map_err(|e| DrawingError::EnhancementFailed {
            page: index,
            stage: "enhance",
            detail: format!("task panicked: {e}"),
        })?
}

/// Decode and enhance every page of the drawing, without contacting any
/// provider.
pub async fn enhance_all(
    raw: &RawDrawing,
    profile: EnhancementProfile,
    config: &AnalysisConfig,
) -> Result<Vec<Page>, DrawingError> {
    let pages = decode_pages(raw, config).await?;
    let mut enhanced = Vec::with_capacity(pages.len());
    for page in pages {
        enhanced.push(enhance_page(page, profile).await?);
    }
    Ok(enhanced)
}

// ── Entry points ─────────────────────────────────────────────────────────

/// Analyse one drawing with the requested provider.
///
/// # Errors
/// Only preprocessing errors (bad upload, undecodable drawing, failed
/// enhancement) and credential errors (provider not configured). Provider
/// failures are returned as a minimal result with zero confidence.
pub async fn analyze(
    ctx: &AnalysisContext,
    request: &AnalysisRequest,
) -> Result<DrawingAnalysisResult, DrawingError> {
    info!("Analysing '{}' with {}", request.filename, request.provider);
    let raw = RawDrawing::from_upload(
        request.filename.as_str(),
        request.bytes.clone(),
        ctx.config.max_input_bytes,
    )?;
    let adapter = ctx.adapter(request.provider)?;

    let prepared = match adapter.input_kind() {
        InputKind::EnhancedPage => {
            Some(preprocess(&raw, request.profile, request.page, &ctx.config).await?)
        }
        InputKind::RawDrawing => None,
    };

    Ok(run_provider(ctx, adapter.as_ref(), &raw, prepared.as_ref(), request).await)
}

/// Analyse one drawing with two providers concurrently and compare them.
///
/// `request.provider` is the first side. The page is preprocessed once and
/// shared. Preprocessing errors abort the whole comparison; everything after
/// that, including a side whose provider is not configured, fails per side.
pub async fn compare(
    ctx: &AnalysisContext,
    request: &AnalysisRequest,
    second: ProviderId,
) -> Result<ComparisonOutcome, DrawingError> {
    info!(
        "Comparing {} vs {} on '{}'",
        request.provider, second, request.filename
    );
    let raw = RawDrawing::from_upload(
        request.filename.as_str(),
        request.bytes.clone(),
        ctx.config.max_input_bytes,
    )?;
    let first_adapter = ctx.adapter(request.provider);
    let second_adapter = ctx.adapter(second);

    let needs_page = [&first_adapter, &second_adapter]
        .into_iter()
        .any(|a| matches!(a, Ok(a) if a.input_kind() == InputKind::EnhancedPage));
    let prepared = if needs_page {
        Some(preprocess(&raw, request.profile, request.page, &ctx.config).await?)
    } else {
        None
    };

    let side = |id: ProviderId, adapter: Result<Arc<dyn ProviderAdapter>, DrawingError>| {
        let raw = &raw;
        let prepared = prepared.as_ref();
        async move {
            match adapter {
                Ok(adapter) => run_provider(ctx, adapter.as_ref(), raw, prepared, request).await,
                Err(e) => {
                    warn!("{} unavailable for comparison: {}", id, e);
                    normalize_failure(id, UNKNOWN, Duration::ZERO, &e, &request.filename)
                }
            }
        }
    };

    let (first, second) = tokio::join!(
        side(request.provider, first_adapter),
        side(second, second_adapter)
    );
    Ok(ComparisonOutcome::new(first, second))
}

/// Call one adapter and normalise whatever comes back.
async fn run_provider(
    ctx: &AnalysisContext,
    adapter: &dyn ProviderAdapter,
    raw: &RawDrawing,
    prepared: Option<&PreparedPage>,
    request: &AnalysisRequest,
) -> DrawingAnalysisResult {
    let id = adapter.id();
    let config = &ctx.config;
    let params = AnalysisParams::from_config(config, request.reasoning);

    let input = match (adapter.input_kind(), prepared) {
        (InputKind::RawDrawing, _) => AdapterInput::Raw(raw),
        (InputKind::EnhancedPage, Some(p)) => AdapterInput::Page(&p.encoded),
        (InputKind::EnhancedPage, None) => {
            let err = DrawingError::Internal(format!("{id} needs a preprocessed page"));
            return normalize_failure(id, adapter.model(), Duration::ZERO, &err, &request.filename);
        }
    };

    if let Some(cb) = &config.progress_callback {
        cb.on_provider_start(id);
    }
    let started = Instant::now();

    // Dropping the adapter future on timeout abandons the call.
    let outcome = match tokio::time::timeout(config.api_timeout(), adapter.analyze(input, &params)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(DrawingError::ApiTimeout {
            provider: id.to_string(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
    };
    let elapsed = started.elapsed();

    if let Some(cb) = &config.progress_callback {
        cb.on_provider_complete(id, outcome.is_ok(), elapsed.as_millis() as u64);
    }

    let mut result = match outcome {
        Ok(native) => {
            let opts = NormalizeOptions {
                confidence_threshold: request.confidence_threshold,
                filename: &request.filename,
                include_raw: config.include_raw_response,
            };
            normalize(native, &opts)
        }
        Err(e) => {
            warn!("{} failed after {:?}: {}", id, elapsed, e);
            normalize_failure(id, adapter.model(), elapsed, &e, &request.filename)
        }
    };

    if let (InputKind::EnhancedPage, Some(p)) = (adapter.input_kind(), prepared) {
        if p.total_pages > 1 {
            result.metadata.warnings.push(format!(
                "Drawing has {} pages; only page {} was analysed",
                p.total_pages, p.encoded.page_index
            ));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_settings_register_nothing() {
        let settings = ProviderSettings::from_lookup(|_| None);
        let ctx = AnalysisContext::from_settings(AnalysisConfig::default(), &settings);
        assert!(ctx.providers().is_empty());

        let err = ctx.adapter(ProviderId::ReasoningEffort).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Credential);
        assert!(err.to_string().contains("OPENAI_API_KEY"), "{err}");
    }

    #[test]
    fn extraction_needs_endpoint_too() {
        let settings = ProviderSettings::from_lookup(|k| {
            (k == "W24TECHREAD_AUTH_TOKEN").then(|| "token".to_string())
        });
        let ctx = AnalysisContext::from_settings(AnalysisConfig::default(), &settings);
        let err = ctx.adapter(ProviderId::StructuredExtraction).err().unwrap();
        assert!(err.to_string().contains("DRAWING_EXTRACTION_ENDPOINT"), "{err}");
    }

    #[test]
    fn reasoning_registered_with_key() {
        let settings = ProviderSettings::from_lookup(|k| {
            (k == "OPENAI_API_KEY").then(|| "sk-test".to_string())
        });
        let ctx = AnalysisContext::from_settings(AnalysisConfig::default(), &settings);
        assert!(ctx.providers().contains(&ProviderId::ReasoningEffort));
        assert_eq!(
            ctx.adapter(ProviderId::ReasoningEffort).unwrap().model(),
            crate::config::DEFAULT_REASONING_MODEL
        );
    }

    #[tokio::test]
    async fn preprocess_yields_decodable_page() {
        let img = image::RgbImage::from_fn(40, 30, |x, y| {
            let v = if x % 9 == 0 || y % 7 == 0 { 25 } else { 230 };
            image::Rgb([v, v, v])
        });
        let mut png = Vec::new();
        img.write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let raw = RawDrawing::from_upload("part.png", png, 1 << 20).unwrap();

        let prepared = preprocess(&raw, EnhancementProfile::Aggressive, 1, &AnalysisConfig::default())
            .await
            .unwrap();
        assert_eq!(prepared.total_pages, 1);
        assert_eq!((prepared.encoded.width, prepared.encoded.height), (40, 30));

        let back = crate::pipeline::encode::decode_payload(&prepared.encoded.base64).unwrap();
        assert_eq!((back.width(), back.height()), (40, 30));
    }

    #[test]
    fn request_defaults() {
        let req = AnalysisRequest::new(ProviderId::VisionChat, "a.png", vec![1]);
        assert_eq!(req.page, 1);
        assert_eq!(req.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(req.profile, EnhancementProfile::Balanced);
        assert_eq!(req.reasoning, ReasoningDepth::High);
    }
}
