pub mod mock;
pub mod openai;

pub use mock::MockProvider;
pub use openai::OpenAiClient;

use crate::llm::LlmClient;
use anyhow::Result;
use heartline_core::config::LlmConfig;
use std::sync::Arc;

/// Build the configured provider.
pub fn from_config(cfg: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider::new(&cfg.model))),
        "openai" | "openai-compatible" => Ok(Arc::new(OpenAiClient::new(cfg)?)),
        other => anyhow::bail!("Unknown LLM provider '{}', expected 'openai' or 'mock'", other),
    }
}
