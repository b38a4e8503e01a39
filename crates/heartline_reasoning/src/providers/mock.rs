//! Mock LLM Provider: deterministic responses for testing without API keys.
//!
//! Replies are served from a queue; once it is empty a canned JSON reply that
//! echoes the last user message is returned.

use crate::api_types::{ChatMessage, ChatRole, CompletionResponse};
use crate::llm::{CompletionParams, LlmClient};
use anyhow::Result;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
enum Scripted {
    Reply(String),
    Fail(String),
}

#[derive(Debug, Default)]
pub struct MockProvider {
    model: String,
    queue: Mutex<VecDeque<Scripted>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_system: Mutex<Option<String>>,
}

impl MockProvider {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..Self::default()
        }
    }

    /// Queue a raw completion text.
    pub fn push_reply(&self, text: impl Into<String>) -> &Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Scripted::Reply(text.into()));
        }
        self
    }

    /// Queue a provider failure.
    pub fn push_failure(&self, msg: impl Into<String>) -> &Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(Scripted::Fail(msg.into()));
        }
        self
    }

    /// Sleep before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// System prompt of the most recent call.
    pub fn last_system_prompt(&self) -> Option<String> {
        self.last_system.lock().ok().and_then(|s| s.clone())
    }

    fn canned_reply(&self, messages: &[ChatMessage]) -> String {
        let heard = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.chars().take(60).collect::<String>())
            .unwrap_or_default();
        json!({
            "reply": format!("(mock {}) I hear you: {}", self.model, heard),
            "emotion": "happy",
            "inner_thought": "This is going well.",
            "choices": [
                {"text": "Tell me more about your day", "tone": "curious", "affection_hint": 1},
                {"text": "You always make me smile", "tone": "sweet", "affection_hint": 3}
            ],
            "affection_delta": 2
        })
        .to_string()
    }
}

#[async_trait::async_trait]
impl LlmClient for MockProvider {
    async fn complete(
        &self,
        system: &str,
        messages: Vec<ChatMessage>,
        _params: CompletionParams,
    ) -> Result<CompletionResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_system.lock() {
            *last = Some(system.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.queue.lock().ok().and_then(|mut q| q.pop_front());
        let text = match next {
            Some(Scripted::Reply(text)) => text,
            Some(Scripted::Fail(msg)) => anyhow::bail!("mock provider failure: {}", msg),
            None => self.canned_reply(&messages),
        };
        Ok(CompletionResponse {
            text,
            finish_reason: Some("stop".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_canned_reply_echoes_user() {
        let provider = MockProvider::new("test-model");
        let resp = provider
            .complete("system", vec![ChatMessage::user("hello there")], CompletionParams::default())
            .await
            .unwrap();
        assert!(resp.text.contains("test-model"));
        assert!(resp.text.contains("hello there"));
        assert_eq!(provider.calls(), 1);
        assert_eq!(provider.last_system_prompt().as_deref(), Some("system"));
    }

    #[tokio::test]
    async fn test_mock_queue_order() {
        let provider = MockProvider::new("m");
        provider.push_failure("boom").push_reply("second");
        let params = CompletionParams::default();
        assert!(provider.complete("s", vec![], params).await.is_err());
        let resp = provider.complete("s", vec![], params).await.unwrap();
        assert_eq!(resp.text, "second");
        assert_eq!(provider.calls(), 2);
    }
}
