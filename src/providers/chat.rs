//! Vision-chat adapter: one page + instructions → one JSON object.
//!
//! Any backend `edgequake_llm` supports (OpenAI, Anthropic, Gemini, Ollama,
//! …) can sit behind this adapter; which one is chosen by
//! `DRAWING_CHAT_PROVIDER` / `DRAWING_CHAT_MODEL`.
//!
//! ## Retry Strategy
//!
//! Transport failures (429, 5xx, resets) are retried with exponential
//! backoff: 500 ms → 1 s → 2 s with the defaults. A reply that arrives but
//! is not JSON is final; asking again for the same page rarely helps and
//! doubles the cost.

use super::{
    backoff_delay, parse_json_reply, AdapterInput, AnalysisParams, NativePayload,
    ProviderAdapter, ProviderNativeResult,
};
use crate::config::{ProviderId, ProviderSettings};
use crate::error::DrawingError;
use crate::pipeline::encode::EncodedPage;
use crate::prompts::{user_prompt, SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tracing::{debug, warn};

pub struct VisionChatAdapter {
    llm: Arc<dyn LLMProvider>,
    model: String,
}

impl std::fmt::Debug for VisionChatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionChatAdapter")
            .field("llm", &"<dyn LLMProvider>")
            .field("model", &self.model)
            .finish()
    }
}

impl VisionChatAdapter {
    /// Wrap an already-configured chat provider.
    pub fn new(llm: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }

    /// Build from settings. Fails with a credential error before any client
    /// exists when the selected backend's key is missing.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, DrawingError> {
        settings.chat_credential()?;
        let llm = ProviderFactory::create_llm_provider(&settings.chat_provider, &settings.chat_model)
            .map_err(|e| DrawingError::ProviderNotConfigured {
                provider: ProviderId::VisionChat.to_string(),
                hint: format!("{} backend: {e}", settings.chat_provider),
            })?;
        Ok(Self::new(llm, settings.chat_model.clone()))
    }
}

/// System prompt, then the page image with the depth-specific instruction.
pub(crate) fn build_messages(page: &EncodedPage, params: &AnalysisParams) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user_with_images(user_prompt(params.reasoning), vec![page.to_image_data()]),
    ]
}

fn build_options(params: &AnalysisParams) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(params.temperature),
        max_tokens: Some(params.max_tokens),
        ..Default::default()
    }
}

#[async_trait]
impl ProviderAdapter for VisionChatAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::VisionChat
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
                "vision-chat adapter needs an encoded page".into(),
            ));
        };

        let start = Instant::now();
        let messages = build_messages(page, params);
        let options = build_options(params);
        let mut last_err: Option<String> = None;

        for attempt in 0..=params.max_retries {
            if attempt > 0 {
                let backoff = backoff_delay(params.retry_backoff_ms, attempt);
                warn!(
                    "vision-chat: retry {}/{} after {:?}",
                    attempt, params.max_retries, backoff
                );
                sleep(backoff).await;
            }

            match self.llm.chat(&messages, Some(&options)).await {
                Ok(response) => {
                    let elapsed = start.elapsed();
                    debug!(
                        "vision-chat: {} input tokens, {} output tokens, {:?}",
                        response.prompt_tokens, response.completion_tokens, elapsed
                    );
                    let value = parse_json_reply(ProviderId::VisionChat, &response.content)?;
                    return Ok(ProviderNativeResult {
                        provider: ProviderId::VisionChat,
                        model: self.model.clone(),
                        payload: NativePayload::Json(value),
                        tokens_used: Some((response.prompt_tokens + response.completion_tokens) as u64),
                        elapsed,
                        warnings: Vec::new(),
                    });
                }
                Err(e) => {
                    let msg = e.to_string();
                    warn!("vision-chat: attempt {} failed — {}", attempt + 1, msg);
                    last_err = Some(msg);
                }
            }
        }

        Err(DrawingError::ProviderApi {
            provider: ProviderId::VisionChat.to_string(),
            message: last_err.unwrap_or_else(|| "Unknown error".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, ReasoningDepth};
    use crate::error::ErrorKind;
    use crate::pipeline::encode::encode;
    use crate::pipeline::render::Page;
    use image::RgbImage;

    #[test]
    fn options_follow_params() {
        let params = AnalysisParams::from_config(&AnalysisConfig::default(), ReasoningDepth::High);
        let opts = build_options(&params);
        assert_eq!(opts.temperature, Some(0.1));
        assert_eq!(opts.max_tokens, Some(16384));
    }

    #[test]
    fn messages_are_system_then_user() {
        let page = encode(&Page::new(1, RgbImage::new(8, 8))).unwrap();
        let params = AnalysisParams::from_config(&AnalysisConfig::default(), ReasoningDepth::Medium);
        let messages = build_messages(&page, &params);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn missing_key_fails_before_client() {
        let settings = ProviderSettings::from_lookup(|_| None);
        let err = VisionChatAdapter::from_settings(&settings).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Credential);
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }
}
