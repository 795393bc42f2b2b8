//! End-to-end orchestration tests with in-memory stub providers.
//!
//! No network and no pdfium: drawings are PNGs built in memory, and every
//! provider is a stub that counts its calls and records what it was given.

use async_trait::async_trait;
use edgequake_drawing::analyze::DEFAULT_CONFIDENCE_THRESHOLD;
use edgequake_drawing::compare::Side;
use edgequake_drawing::providers::{
    AdapterInput, AnalysisParams, InputKind, NativePayload, ProviderAdapter, ProviderNativeResult,
};
use edgequake_drawing::{
    analyze, compare, AnalysisConfig, AnalysisContext, AnalysisProgressCallback, AnalysisRequest,
    DrawingError, EnhancementProfile, ErrorKind, ProviderId, ReasoningDepth,
};
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

// ── Stubs ────────────────────────────────────────────────────────────────

enum Behaviour {
    Reply(Value),
    Fail,
    Hang,
}

struct StubAdapter {
    id: ProviderId,
    input: InputKind,
    behaviour: Behaviour,
    calls: AtomicUsize,
    /// (width, height) of the page, or byte length of the raw drawing.
    seen: Mutex<Vec<(u32, u32)>>,
    depths: Mutex<Vec<ReasoningDepth>>,
}

impl StubAdapter {
    fn new(id: ProviderId, behaviour: Behaviour) -> Arc<Self> {
        Self::with_input(id, InputKind::EnhancedPage, behaviour)
    }

    fn with_input(id: ProviderId, input: InputKind, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            id,
            input,
            behaviour,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            depths: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    fn id(&self) -> ProviderId {
        self.id
    }

    fn model(&self) -> &str {
        "stub-model"
    }

    fn input_kind(&self) -> InputKind {
        self.input
    }

    async fn analyze(
        &self,
        input: AdapterInput<'_>,
        params: &AnalysisParams,
    ) -> Result<ProviderNativeResult, DrawingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.depths.lock().unwrap().push(params.reasoning);
        let seen = match input {
            AdapterInput::Page(p) => (p.width, p.height),
            AdapterInput::Raw(r) => (r.bytes.len() as u32, 0),
        };
        self.seen.lock().unwrap().push(seen);

        match &self.behaviour {
            Behaviour::Reply(v) => Ok(ProviderNativeResult {
                provider: self.id,
                model: "stub-model".into(),
                payload: NativePayload::Json(v.clone()),
                tokens_used: Some(1200),
                elapsed: Duration::from_millis(40),
                warnings: Vec::new(),
            }),
            Behaviour::Fail => Err(DrawingError::InvalidJson {
                provider: self.id.to_string(),
                detail: "expected value at line 1 column 1".into(),
            }),
            Behaviour::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("the orchestrator times out first")
            }
        }
    }
}

#[derive(Default)]
struct CountingProgress {
    preprocessed: AtomicUsize,
    started: AtomicUsize,
    failed: AtomicUsize,
}

impl AnalysisProgressCallback for CountingProgress {
    fn on_preprocess_complete(&self, _w: u32, _h: u32, _elapsed_ms: u64) {
        self.preprocessed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_provider_start(&self, _provider: ProviderId) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_provider_complete(&self, _provider: ProviderId, ok: bool, _elapsed_ms: u64) {
        if !ok {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

/// A white sheet with a dark frame and one horizontal dimension line.
fn drawing_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let frame = x < 4 || y < 4 || x >= width - 4 || y >= height - 4;
        let line = y == height / 2 && x > width / 4 && x < 3 * width / 4;
        if frame || line {
            Rgb([20, 20, 20])
        } else {
            Rgb([235, 235, 235])
        }
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn bracket_reply() -> Value {
    json!({
        "title": "Bracket",
        "drawing_number": "BR-204",
        "geometry": {
            "part_type": "bracket",
            "overall_dimensions": {
                "length": {"value": 120, "unit": "mm", "tolerance": "±0.1", "confidence": 0.9},
                "width":  {"value": 80, "unit": "mm", "confidence": 0.5}
            },
            "features": [
                {"type": "hole", "quantity": 2, "dimensions": {"diameter": 6.5}, "confidence": 0.8}
            ]
        },
        "manufacturing": {"primary_process": "CNC milling", "setup_count": 0},
        "confidence_score": 0.85
    })
}

fn context(config: AnalysisConfig, adapters: &[Arc<StubAdapter>]) -> AnalysisContext {
    adapters.iter().fold(AnalysisContext::new(config), |ctx, a| {
        ctx.with_adapter(a.clone() as Arc<dyn ProviderAdapter>)
    })
}

// ── analyze ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn balanced_png_drops_low_confidence_dimension() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "bracket.png", drawing_png(800, 600))
        .with_profile(EnhancementProfile::Balanced)
        .with_threshold(0.7);

    let result = analyze(&ctx, &request).await.unwrap();

    assert_eq!(chat.calls(), 1);
    assert_eq!(chat.seen.lock().unwrap()[0], (800, 600));
    assert_eq!(result.geometry.overall_dimensions.len(), 1);
    assert!(result.geometry.overall_dimensions.contains_key("length"));
    assert_eq!(result.geometry.features.len(), 1);
    assert_eq!(result.geometry.complexity_score, 0.7);
    assert_eq!(result.manufacturing.setup_count, 1);
    assert_eq!(result.metadata.provider, "vision-chat");
    assert_eq!(result.metadata.tokens_used, Some(1200));
    assert_eq!(result.metadata.confidence_score, 0.85);
    assert!(result.raw_response.is_none());
}

#[tokio::test]
async fn higher_threshold_never_keeps_more_items() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);
    let png = drawing_png(160, 120);

    let mut previous: Option<(usize, usize, usize)> = None;
    for t in [0.0, 0.5, 0.85, 0.95] {
        let request = AnalysisRequest::new(ProviderId::VisionChat, "b.png", png.clone())
            .with_profile(EnhancementProfile::Fast)
            .with_threshold(t);
        let counts = analyze(&ctx, &request).await.unwrap().item_counts();
        if let Some(p) = previous {
            assert!(counts.0 <= p.0 && counts.1 <= p.1 && counts.2 <= p.2, "{t}: {counts:?} vs {p:?}");
        }
        previous = Some(counts);
    }
    assert_eq!(previous, Some((0, 0, 0)));
}

#[tokio::test]
async fn oversized_input_never_reaches_provider() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let config = AnalysisConfig::builder().max_input_bytes(1024).build().unwrap();
    let ctx = context(config, &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "big.png", vec![0u8; 4096]);

    let err = analyze(&ctx, &request).await.unwrap_err();
    assert!(matches!(err, DrawingError::InputTooLarge { .. }));
    assert_eq!(err.kind(), ErrorKind::Preprocessing);
    assert_eq!(chat.calls(), 0);
}

#[tokio::test]
async fn undecodable_and_disallowed_inputs_fail_fast() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);

    for (name, bytes) in [
        ("scan.png", b"definitely not a png".to_vec()),
        ("drawing.dwg", drawing_png(32, 32)),
        ("empty.jpg", Vec::new()),
    ] {
        let request = AnalysisRequest::new(ProviderId::VisionChat, name, bytes);
        let err = analyze(&ctx, &request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Preprocessing, "{name}: {err}");
    }
    assert_eq!(chat.calls(), 0);
}

#[tokio::test]
async fn missing_provider_is_credential_error() {
    let ctx = context(AnalysisConfig::default(), &[]);
    let request = AnalysisRequest::new(ProviderId::ReasoningEffort, "b.png", drawing_png(64, 48));
    let err = analyze(&ctx, &request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Credential);
    assert_eq!(err.report().kind, ErrorKind::Credential);
}

#[tokio::test]
async fn page_out_of_range_for_single_image() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);
    let request =
        AnalysisRequest::new(ProviderId::VisionChat, "b.png", drawing_png(64, 48)).with_page(2);
    let err = analyze(&ctx, &request).await.unwrap_err();
    assert!(matches!(err, DrawingError::PageOutOfRange { page: 2, total: 1 }));
    assert_eq!(chat.calls(), 0);
}

#[tokio::test]
async fn provider_failure_becomes_minimal_result() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Fail);
    let progress = Arc::new(CountingProgress::default());
    let config = AnalysisConfig::builder()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let ctx = context(config, &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "shaft.png", drawing_png(120, 90));

    let result = analyze(&ctx, &request).await.unwrap();
    assert!(result.is_failure());
    assert_eq!(result.title, "shaft.png");
    assert_eq!(result.metadata.confidence_score, 0.0);
    assert_eq!(result.metadata.model_used, "stub-model");
    assert!(result.metadata.warnings[0].contains("AnalysisError"));
    assert_eq!(result.geometry.complexity_score, 0.0);

    assert_eq!(progress.preprocessed.load(Ordering::SeqCst), 1);
    assert_eq!(progress.started.load(Ordering::SeqCst), 1);
    assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hung_provider_times_out_into_minimal_result() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Hang);
    let config = AnalysisConfig::builder().api_timeout_secs(1).build().unwrap();
    let ctx = context(config, &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "slow.png", drawing_png(64, 48))
        .with_profile(EnhancementProfile::Fast);

    let result = tokio::time::timeout(Duration::from_secs(30), analyze(&ctx, &request))
        .await
        .expect("orchestrator must bound the provider call")
        .unwrap();
    assert!(result.is_failure());
    assert!(result.metadata.warnings[0].contains("timed out"), "{:?}", result.metadata.warnings);
    assert!(result.metadata.processing_time >= 1.0);
}

#[tokio::test]
async fn raw_input_provider_skips_preprocessing() {
    let extraction = StubAdapter::with_input(
        ProviderId::StructuredExtraction,
        InputKind::RawDrawing,
        Behaviour::Reply(json!({"title": "Hub"})),
    );
    let progress = Arc::new(CountingProgress::default());
    let config = AnalysisConfig::builder()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let ctx = context(config, &[extraction.clone()]);
    // Not a real PDF: the backend reads the drawing, not us.
    let request = AnalysisRequest::new(ProviderId::StructuredExtraction, "hub.pdf", vec![7u8; 64]);

    let result = analyze(&ctx, &request).await.unwrap();
    assert_eq!(result.title, "Hub");
    assert_eq!(extraction.seen.lock().unwrap()[0], (64, 0));
    assert_eq!(progress.preprocessed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reasoning_depth_reaches_adapter() {
    let reasoning = StubAdapter::new(ProviderId::ReasoningEffort, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[reasoning.clone()]);
    let request = AnalysisRequest::new(ProviderId::ReasoningEffort, "b.png", drawing_png(64, 48))
        .with_profile(EnhancementProfile::Aggressive)
        .with_reasoning(ReasoningDepth::XHigh);
    assert_ok!(analyze(&ctx, &request).await);
    assert_eq!(*reasoning.depths.lock().unwrap(), [ReasoningDepth::XHigh]);
}

// ── compare ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn comparison_survives_one_failing_side() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let reasoning = StubAdapter::new(ProviderId::ReasoningEffort, Behaviour::Fail);
    let progress = Arc::new(CountingProgress::default());
    let config = AnalysisConfig::builder()
        .progress_callback(progress.clone())
        .build()
        .unwrap();
    let ctx = context(config, &[chat.clone(), reasoning.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "bracket.png", drawing_png(200, 150));

    let outcome = compare(&ctx, &request, ProviderId::ReasoningEffort).await.unwrap();

    assert_eq!(chat.calls(), 1);
    assert_eq!(reasoning.calls(), 1);
    assert_eq!(progress.preprocessed.load(Ordering::SeqCst), 1);
    assert!(!outcome.report.first.failed);
    assert!(outcome.report.second.failed);
    assert_eq!(outcome.report.higher_confidence, Side::First);
    assert_eq!(outcome.first.geometry.overall_dimensions.len(), 1);
    assert_eq!(outcome.report.first.counts.features, 1);
    assert_eq!(outcome.report.second.counts.features, 0);
}

#[tokio::test]
async fn comparison_with_unconfigured_side_still_returns_two_results() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "bracket.png", drawing_png(96, 64));

    let outcome = compare(&ctx, &request, ProviderId::StructuredExtraction)
        .await
        .unwrap();
    assert!(outcome.second.is_failure());
    assert!(outcome.second.metadata.warnings[0].contains("CredentialError"));
    assert_eq!(outcome.second.metadata.provider, "structured-extraction");
    assert_eq!(outcome.report.faster, Side::Second);
}

#[tokio::test]
async fn comparison_of_a_provider_with_itself_matches() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "bracket.png", drawing_png(96, 64))
        .with_profile(EnhancementProfile::Fast);

    let outcome = compare(&ctx, &request, ProviderId::VisionChat).await.unwrap();
    assert_eq!(chat.calls(), 2);
    assert!(outcome.report.all_fields_matched());
    assert_eq!(outcome.report.faster, Side::First);
    assert_eq!(outcome.report.higher_confidence, Side::First);
}

#[tokio::test]
async fn comparison_preprocessing_failure_aborts_both_sides() {
    let chat = StubAdapter::new(ProviderId::VisionChat, Behaviour::Reply(bracket_reply()));
    let reasoning = StubAdapter::new(ProviderId::ReasoningEffort, Behaviour::Reply(bracket_reply()));
    let ctx = context(AnalysisConfig::default(), &[chat.clone(), reasoning.clone()]);
    let request = AnalysisRequest::new(ProviderId::VisionChat, "bad.jpg", b"garbage".to_vec());

    let err = assert_err!(compare(&ctx, &request, ProviderId::ReasoningEffort).await);
    assert_eq!(err.kind(), ErrorKind::Preprocessing);
    assert_eq!(chat.calls() + reasoning.calls(), 0);
}

#[test]
fn default_threshold() {
    assert_eq!(DEFAULT_CONFIDENCE_THRESHOLD, 0.7);
}
