//! Reasoning-effort adapter: the vision-chat contract plus a depth control.
//!
//! Talks to an OpenAI-compatible `/responses` endpoint directly over
//! `reqwest`, because the effort knob is not part of the generic chat
//! abstraction. [`ReasoningDepth`] is sent verbatim as `reasoning.effort`;
//! there is no fallback to a lower effort if the backend rejects it.

use super::{
    backoff_delay, max_backoff, parse_json_reply, AdapterInput, AnalysisParams, NativePayload,
    ProviderAdapter, ProviderNativeResult,
};
use crate::config::{AnalysisConfig, ProviderId, ProviderSettings, ReasoningDepth};
use crate::error::DrawingError;
use crate::pipeline::encode::EncodedPage;
use crate::prompts::{user_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    instructions: &'a str,
    input: Vec<InputMessage>,
    reasoning: ReasoningControl,
    text: TextControl,
    max_output_tokens: usize,
}

#[derive(Debug, Serialize)]
struct InputMessage {
    role: &'static str,
    content: Vec<InputContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputContent {
    InputText { text: String },
    InputImage { image_url: String, detail: &'static str },
}

#[derive(Debug, Serialize)]
struct ReasoningControl {
    effort: &'static str,
}

#[derive(Debug, Serialize)]
struct TextControl {
    verbosity: &'static str,
}

#[derive(Debug, Default, Deserialize)]
struct ResponsesReply {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl ResponsesReply {
    /// Concatenated `output_text` parts of every message item.
    fn output_text(&self) -> String {
        self.output
            .iter()
            .filter(|item| item.kind == "message")
            .flat_map(|item| item.content.iter())
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

fn build_request<'a>(
    model: &'a str,
    page: &EncodedPage,
    params: &AnalysisParams,
) -> ResponsesRequest<'a> {
    ResponsesRequest {
        model,
        instructions: SYSTEM_PROMPT,
        input: vec![InputMessage {
            role: "user",
            content: vec![
                InputContent::InputText {
                    text: user_prompt(params.reasoning),
                },
                InputContent::InputImage {
                    image_url: page.data_url(),
                    detail: "high",
                },
            ],
        }],
        reasoning: ReasoningControl {
            effort: effort(params.reasoning),
        },
        text: TextControl { verbosity: "high" },
        max_output_tokens: params.max_tokens,
    }
}

/// The backend's effort value for a depth hint. One-to-one.
pub fn effort(depth: ReasoningDepth) -> &'static str {
    depth.as_str()
}

// ── Adapter ──────────────────────────────────────────────────────────────

pub struct ReasoningEffortAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl std::fmt::Debug for ReasoningEffortAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReasoningEffortAdapter")
            .field("base_url", &self.base_url)
            .field("api_key", &"<set>")
            .field("model", &self.model)
            .finish()
    }
}

impl ReasoningEffortAdapter {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, DrawingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DrawingError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        })
    }

    pub fn from_settings(
        settings: &ProviderSettings,
        config: &AnalysisConfig,
    ) -> Result<Self, DrawingError> {
        let key = settings
            .openai_api_key
            .as_deref()
            .ok_or_else(|| DrawingError::ProviderNotConfigured {
                provider: ProviderId::ReasoningEffort.to_string(),
                hint: "Set OPENAI_API_KEY to use the reasoning-effort provider.".into(),
            })?;
        Self::new(
            &settings.openai_base_url,
            key,
            &settings.reasoning_model,
            config.api_timeout(),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/responses", self.base_url)
    }

    /// One HTTP round trip. The outer `Err` is final; an inner `Err` is
    /// transient and may be retried.
    async fn attempt(
        &self,
        request: &ResponsesRequest<'_>,
        started: Instant,
    ) -> Result<Result<ResponsesReply, DrawingError>, DrawingError> {
        let provider = ProviderId::ReasoningEffort.to_string();
        let response = match self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(DrawingError::ApiTimeout {
                    provider,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                return Ok(Err(DrawingError::ProviderApi {
                    provider,
                    message: e.to_string(),
                }))
            }
        };

        let status = response.status();
        if status.is_success() {
            let reply = response
                .json::<ResponsesReply>()
                .await
                .map_err(|e| DrawingError::InvalidJson {
                    provider: provider.clone(),
                    detail: format!("response envelope: {e}"),
                })?;
            return Ok(Ok(reply));
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let body = response.text().await.unwrap_or_default();
        let message = error_message(status, &body);

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DrawingError::AuthError {
                provider,
                detail: message,
            }),
            StatusCode::TOO_MANY_REQUESTS => Ok(Err(DrawingError::RateLimitExceeded {
                provider,
                retry_after_secs: retry_after,
            })),
            s if s.is_server_error() => Ok(Err(DrawingError::ProviderApi { provider, message })),
            _ => Err(DrawingError::ProviderApi { provider, message }),
        }
    }
}

/// `error.message` from an OpenAI-style error body, else the status line.
fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .map(|m| format!("HTTP {status}: {m}"))
        .unwrap_or_else(|| format!("HTTP {status}"))
}

#[async_trait]
impl ProviderAdapter for ReasoningEffortAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::ReasoningEffort
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn analyze(
        &self,
        input: AdapterInput<'_>,
        params: &AnalysisParams,
    ) -> Result<ProviderNativeResult, DrawingError> {
        let AdapterInput::Page(page) = input else {
            return Err(DrawingError::Internal(
                "reasoning-effort adapter needs an encoded page".into(),
            ));
        };

        let started = Instant::now();
        let request = build_request(&self.model, page, params);
        info!(
            "reasoning-effort: {} with effort={}",
            self.model, request.reasoning.effort
        );

        let mut last_err = None;
        for attempt in 0..=params.max_retries {
            if attempt > 0 {
                let backoff = match &last_err {
                    Some(DrawingError::RateLimitExceeded {
                        retry_after_secs: Some(secs),
                        ..
                    }) => Duration::from_secs(*secs)
                        .min(max_backoff(params.retry_backoff_ms, params.max_retries)),
                    _ => backoff_delay(params.retry_backoff_ms, attempt),
                };
                warn!(
                    "reasoning-effort: retry {}/{} after {:?}",
                    attempt, params.max_retries, backoff
                );
                sleep(backoff).await;
            }

            match self.attempt(&request, started).await? {
                Ok(reply) => {
                    let elapsed = started.elapsed();
                    let text = reply.output_text();
                    let tokens = reply.usage.as_ref().and_then(|u| u.total_tokens);
                    debug!("reasoning-effort: {:?} tokens, {:?}", tokens, elapsed);

                    if text.trim().is_empty() {
                        return Err(DrawingError::InvalidJson {
                            provider: ProviderId::ReasoningEffort.to_string(),
                            detail: format!(
                                "reply contained no output text (status {})",
                                reply.status.as_deref().unwrap_or("unknown")
                            ),
                        });
                    }
                    let value = parse_json_reply(ProviderId::ReasoningEffort, &text)?;

                    let mut warnings = Vec::new();
                    if reply.status.as_deref() == Some("incomplete") {
                        warnings.push("Reasoning response was marked incomplete".to_string());
                    }
                    return Ok(ProviderNativeResult {
                        provider: ProviderId::ReasoningEffort,
                        model: self.model.clone(),
                        payload: NativePayload::Json(value),
                        tokens_used: tokens,
                        elapsed,
                        warnings,
                    });
                }
                Err(e) => {
                    warn!("reasoning-effort: attempt {} failed — {}", attempt + 1, e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DrawingError::ProviderApi {
            provider: ProviderId::ReasoningEffort.to_string(),
            message: "Unknown error".into(),
        }))
    }
}
