use crate::api_types::{ChatMessage, CompletionResponse};
use anyhow::Result;
use async_trait::async_trait;
use heartline_core::config::LlmConfig;

/// Sampling parameters for one completion.
#[derive(Debug, Clone, Copy)]
pub struct CompletionParams {
    /// Maximum tokens to generate (will be clamped to provider limits)
    pub max_tokens: u32,
    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        Self {
            max_tokens: 600,
            temperature: 0.85,
        }
    }
}

impl From<&LlmConfig> for CompletionParams {
    fn from(cfg: &LlmConfig) -> Self {
        Self {
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature.clamp(0.0, 2.0),
        }
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send one chat completion. `system` goes first, then `messages` in order.
    async fn complete(
        &self,
        system: &str,
        messages: Vec<ChatMessage>,
        params: CompletionParams,
    ) -> Result<CompletionResponse>;
}

// Providers available in crate::providers
