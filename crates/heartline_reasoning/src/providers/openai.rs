use crate::api_types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, CompletionResponse};
use crate::llm::{CompletionParams, LlmClient};
use crate::retry::{with_retry, RetryConfig};
use anyhow::{Context, Result};
use heartline_core::config::LlmConfig;
use reqwest::Client;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    retry: RetryConfig,
}

impl OpenAiClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.is_empty());
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if api_key.is_none() {
            tracing::warn!("No API key configured for {}, requests will be unauthenticated", base_url);
        }

        Ok(Self {
            client: Client::builder()
                .timeout(Duration::from_secs(cfg.request_timeout_secs.max(1)))
                .build()
                .context("Failed to build HTTP client")?,
            api_key,
            base_url,
            model: cfg.model.clone(),
            // Transient HTTP failures only; DialogueEngine retries the turn as a whole
            retry: RetryConfig {
                max_attempts: 2,
                ..RetryConfig::default()
            },
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        system: &str,
        messages: Vec<ChatMessage>,
        params: CompletionParams,
    ) -> Result<CompletionResponse> {
        // OpenAI puts the system prompt first as a "system" message
        let mut wire_messages = Vec::with_capacity(messages.len() + 1);
        wire_messages.push(ChatMessage {
            role: ChatRole::System,
            content: system.to_string(),
        });
        wire_messages.extend(messages);

        let payload = ChatCompletionRequest {
            model: &self.model,
            messages: wire_messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let response = with_retry(&self.retry, "OpenAI", || async {
            let mut req = self.client.post(&url).json(&payload);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            req.send().await.context("Failed to send request to OpenAI")
        })
        .await?;

        let body: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to decode OpenAI response")?;
        let choice = body
            .choices
            .into_iter()
            .next()
            .context("OpenAI response contained no choices")?;
        let text = choice.message.content.unwrap_or_default();
        tracing::debug!(
            "OpenAI completion: {} chars, finish_reason={:?}",
            text.chars().count(),
            choice.finish_reason
        );

        Ok(CompletionResponse {
            text,
            finish_reason: choice.finish_reason,
        })
    }
}
