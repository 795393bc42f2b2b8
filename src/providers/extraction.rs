//! Structured-extraction adapter: typed requests in, typed fragments out.
//!
//! Instead of a prompt, the adapter registers a fixed set of extraction
//! requests ([`FragmentKind::ALL`]) against the backend and then collects
//! the fragments it sends back, in whatever order they arrive:
//!
//! ```text
//! submit ──▶ fragment(metadata) ─▶ fragment(features) ─▶ … ─▶ complete
//!                   │                      │                     │
//!                   ▼                      ▼                     ▼
//!             ┌──────────────── FragmentAccumulator ────────────────┐
//!             │ keyed by kind; waits ≤ timeout for `complete`, then │
//!             │ keeps listening for `grace` to catch stragglers     │
//!             └─────────────────────────────────────────────────────┘
//! ```
//!
//! A missing completion signal is "partial data", not failure: whatever
//! arrived is normalised with a warning. Only an empty accumulator is a
//! failure. Dropping the event stream abandons the backend request; no
//! background task is spawned.
//!
//! The transport sits behind [`ExtractionClient`]. [`HttpExtractionClient`]
//! posts the drawing and reads newline-delimited JSON events:
//!
//! ```text
//! {"event":"fragment","kind":"metadata","payload":{…}}
//! {"event":"error","message":"…"}
//! {"event":"complete"}
//! ```

use super::{AdapterInput, AnalysisParams, InputKind, NativePayload, ProviderAdapter, ProviderNativeResult};
use crate::config::{AnalysisConfig, ProviderId, ProviderSettings};
use crate::error::DrawingError;
use crate::pipeline::input::{MediaKind, RawDrawing};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Service name reported as `model_used`.
pub const DEFAULT_SERVICE_NAME: &str = "werk24-techread";

// ── Fragments ────────────────────────────────────────────────────────────

/// The typed extraction requests registered with the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    /// Title block: designation, drawing number, revision, scale, material.
    Metadata,
    /// Geometric features: dimensions, tolerances, machined features.
    Features,
    /// Process insights: manufacturing methods, difficulty, operations.
    Insights,
}

impl FragmentKind {
    pub const ALL: [FragmentKind; 3] = [
        FragmentKind::Metadata,
        FragmentKind::Features,
        FragmentKind::Insights,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentKind::Metadata => "metadata",
            FragmentKind::Features => "features",
            FragmentKind::Insights => "insights",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fragments received so far, keyed by kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentSet {
    pub fragments: BTreeMap<FragmentKind, Value>,
    /// The backend signalled completion.
    pub completed: bool,
}

impl FragmentSet {
    /// Add a fragment. Repeated kinds merge: object keys are combined and
    /// arrays under the same key are concatenated.
    pub fn insert(&mut self, kind: FragmentKind, payload: Value) {
        match self.fragments.get_mut(&kind) {
            Some(existing) => merge(existing, payload),
            None => {
                self.fragments.insert(kind, payload);
            }
        }
    }

    pub fn get(&self, kind: FragmentKind) -> Option<&Value> {
        self.fragments.get(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    /// Diagnostic JSON form, used as `raw_response`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (kind, payload) in &self.fragments {
            map.insert(kind.as_str().to_string(), payload.clone());
        }
        map.insert("completed".into(), Value::Bool(self.completed));
        Value::Object(map)
    }
}

fn merge(into: &mut Value, from: Value) {
    match (into, from) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(Value::Array(existing)) => match v {
                        Value::Array(more) => existing.extend(more),
                        other => existing.push(other),
                    },
                    _ => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => a.extend(b),
        (slot, other) => *slot = other,
    }
}

// ── Events and accumulation ──────────────────────────────────────────────

/// One message from the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ExtractionEvent {
    Fragment { kind: FragmentKind, payload: Value },
    Error { message: String },
    Complete,
}

/// Outcome of [`accumulate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentAccumulator {
    pub set: FragmentSet,
    /// Backend-reported errors, in arrival order.
    pub errors: Vec<String>,
    /// No completion arrived before the bounded wait elapsed.
    pub timed_out: bool,
    /// The stream ended without a completion signal.
    pub closed_early: bool,
}

impl FragmentAccumulator {
    fn apply(&mut self, event: ExtractionEvent) {
        match event {
            ExtractionEvent::Fragment { kind, payload } => {
                debug!("extraction: received {} fragment", kind);
                self.set.insert(kind, payload);
            }
            ExtractionEvent::Error { message } => {
                warn!("extraction: backend error — {}", message);
                self.errors.push(message);
            }
            ExtractionEvent::Complete => {
                debug!("extraction: completion signalled");
                self.set.completed = true;
            }
        }
    }
}

/// Collect events until completion (plus `grace`) or until `timeout`.
pub async fn accumulate(
    mut events: BoxStream<'static, ExtractionEvent>,
    timeout: Duration,
    grace: Duration,
) -> FragmentAccumulator {
    let mut acc = FragmentAccumulator::default();
    let deadline = tokio::time::Instant::now() + timeout;

    while !acc.set.completed {
        match tokio::time::timeout_at(deadline, events.next()).await {
            Ok(Some(event)) => acc.apply(event),
            Ok(None) => {
                acc.closed_early = true;
                return acc;
            }
            Err(_) => {
                acc.timed_out = true;
                return acc;
            }
        }
    }

    // Fragments may trail the completion signal.
    let grace_deadline = tokio::time::Instant::now() + grace;
    while let Ok(Some(event)) = tokio::time::timeout_at(grace_deadline, events.next()).await {
        acc.apply(event);
    }
    acc
}

// ── Transport ────────────────────────────────────────────────────────────

/// Submits a drawing with a set of extraction requests and returns the
/// backend's event stream.
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn submit(
        &self,
        drawing: &RawDrawing,
        asks: &[FragmentKind],
    ) -> Result<BoxStream<'static, ExtractionEvent>, DrawingError>;
}

/// NDJSON-over-HTTP extraction client.
pub struct HttpExtractionClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    region: Option<String>,
}

impl fmt::Debug for HttpExtractionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExtractionClient")
            .field("endpoint", &self.endpoint)
            .field("token", &"<set>")
            .field("region", &self.region)
            .finish()
    }
}

impl HttpExtractionClient {
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        region: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, DrawingError> {
        // No overall timeout: the response is a long-lived event stream and
        // the accumulator enforces its own bound.
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| DrawingError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
            region,
        })
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn submit(
        &self,
        drawing: &RawDrawing,
        asks: &[FragmentKind],
    ) -> Result<BoxStream<'static, ExtractionEvent>, DrawingError> {
        let provider = ProviderId::StructuredExtraction.to_string();
        let asks = asks.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(",");
        let content_type = match drawing.kind {
            MediaKind::Pdf => "application/pdf",
            MediaKind::Image => "application/octet-stream",
        };

        let mut request = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header("X-Asks", asks)
            .header("X-Filename", drawing.filename.as_str())
            .body(drawing.bytes.clone());
        if let Some(region) = &self.region {
            request = request.header("X-Auth-Region", region.as_str());
        }

        let response = request.send().await.map_err(|e| DrawingError::ProviderApi {
            provider: provider.clone(),
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DrawingError::AuthError {
                provider,
                detail: format!("HTTP {status}"),
            });
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(DrawingError::RateLimitExceeded {
                provider,
                retry_after_secs: None,
            });
        }
        if !status.is_success() {
            return Err(DrawingError::ProviderApi {
                provider,
                message: format!("HTTP {status}"),
            });
        }

        Ok(ndjson_events(response.bytes_stream()))
    }
}

/// Split a byte stream into lines and parse each as an [`ExtractionEvent`].
pub fn ndjson_events<S, B, E>(bytes: S) -> BoxStream<'static, ExtractionEvent>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: fmt::Display,
{
    struct State<S> {
        inner: Pin<Box<S>>,
        buf: Vec<u8>,
        queue: VecDeque<ExtractionEvent>,
        finished: bool,
    }

    let state = State {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        queue: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                return Some((event, st));
            }
            if st.finished {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => {
                    st.buf.extend_from_slice(chunk.as_ref());
                    while let Some(pos) = st.buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = st.buf.drain(..=pos).collect();
                        if let Some(event) = parse_line(&line) {
                            st.queue.push_back(event);
                        }
                    }
                }
                Some(Err(e)) => {
                    st.queue.push_back(ExtractionEvent::Error {
                        message: format!("event stream interrupted: {e}"),
                    });
                    st.finished = true;
                }
                None => {
                    let rest = std::mem::take(&mut st.buf);
                    if let Some(event) = parse_line(&rest) {
                        st.queue.push_back(event);
                    }
                    st.finished = true;
                }
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> Option<ExtractionEvent> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(text).unwrap_or_else(|e| ExtractionEvent::Error {
            message: format!("unreadable event ({e})"),
        }),
    )
}

// ── Adapter ──────────────────────────────────────────────────────────────

pub struct StructuredExtractionAdapter {
    client: Arc<dyn ExtractionClient>,
    service: String,
}

impl fmt::Debug for StructuredExtractionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredExtractionAdapter")
            .field("client", &"<dyn ExtractionClient>")
            .field("service", &self.service)
            .finish()
    }
}

impl StructuredExtractionAdapter {
    pub fn new(client: Arc<dyn ExtractionClient>, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    pub fn from_settings(
        settings: &ProviderSettings,
        config: &AnalysisConfig,
    ) -> Result<Self, DrawingError> {
        let not_configured = |hint: &str| DrawingError::ProviderNotConfigured {
            provider: ProviderId::StructuredExtraction.to_string(),
            hint: hint.to_string(),
        };
        let token = settings
            .extraction_token
            .as_deref()
            .ok_or_else(|| not_configured("Set W24TECHREAD_AUTH_TOKEN to use structured extraction."))?;
        let endpoint = settings
            .extraction_endpoint
            .as_deref()
            .ok_or_else(|| not_configured("Set DRAWING_EXTRACTION_ENDPOINT to the extraction service URL."))?;

        let connect_timeout = config.extraction_timeout().min(Duration::from_secs(30));
        let client = HttpExtractionClient::new(
            endpoint,
            token,
            settings.extraction_region.clone(),
            connect_timeout,
        )?;
        Ok(Self::new(Arc::new(client), DEFAULT_SERVICE_NAME))
    }
}

#[async_trait]
impl ProviderAdapter for StructuredExtractionAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::StructuredExtraction
    }

    fn model(&self) -> &str {
        &self.service
    }

    fn input_kind(&self) -> InputKind {
        InputKind::RawDrawing
    }

    async fn analyze(
        &self,
        input: AdapterInput<'_>,
        params: &AnalysisParams,
    ) -> Result<ProviderNativeResult, DrawingError> {
        let AdapterInput::Raw(drawing) = input else {
            return Err(DrawingError::Internal(
                "structured-extraction adapter needs the raw drawing".into(),
            ));
        };
        let provider = ProviderId::StructuredExtraction.to_string();

        let started = Instant::now();
        info!("extraction: submitting '{}' ({} bytes)", drawing.filename, drawing.bytes.len());
        let events = self.client.submit(drawing, &FragmentKind::ALL).await?;
        let acc = accumulate(events, params.extraction_timeout, params.extraction_grace).await;
        let elapsed = started.elapsed();

        if acc.set.is_empty() {
            return Err(if !acc.errors.is_empty() {
                DrawingError::ProviderApi {
                    provider,
                    message: acc.errors.join("; "),
                }
            } else if acc.timed_out {
                DrawingError::ApiTimeout {
                    provider,
                    elapsed_ms: elapsed.as_millis() as u64,
                }
            } else {
                DrawingError::IncompleteExtraction {
                    provider,
                    detail: "no fragments received".into(),
                }
            });
        }

        let mut warnings: Vec<String> = acc.errors.iter().map(|e| format!("Error: {e}")).collect();
        if !acc.set.completed {
            let missing: Vec<&str> = FragmentKind::ALL
                .iter()
                .filter(|k| acc.set.get(**k).is_none())
                .map(|k| k.as_str())
                .collect();
            let cause = if acc.timed_out {
                format!("no completion within {:?}", params.extraction_timeout)
            } else {
                "stream closed before completion".to_string()
            };
            let mut w = format!("Partial data: {cause}");
            if !missing.is_empty() {
                w.push_str(&format!(" (missing: {})", missing.join(", ")));
            }
            warn!("extraction: {}", w);
            warnings.push(w);
        }

        info!(
            "extraction: {} fragment(s) in {:?}, completed={}",
            acc.set.len(),
            elapsed,
            acc.set.completed
        );
        Ok(ProviderNativeResult {
            provider: ProviderId::StructuredExtraction,
            model: self.service.clone(),
            payload: NativePayload::Extraction(acc.set),
            tokens_used: None,
            elapsed,
            warnings,
        })
    }
}
