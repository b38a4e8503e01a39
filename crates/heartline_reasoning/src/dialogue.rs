//! DialogueEngine: one persona reply per turn.
//!
//! Stateless. It reads the session, relationship and persona, asks the LLM,
//! and returns the reply together with the deltas it implies. Persisting
//! them is the caller's job.

use crate::api_types::ChatMessage;
use crate::extraction::{parse_reply, GeneratedChoice, GeneratedReply};
use crate::llm::{CompletionParams, LlmClient};
use crate::prompts::{ContextAssembler, SUMMARY_SYSTEM_PROMPT};
use crate::retry::RetryConfig;
use anyhow::Context;
use async_trait::async_trait;
use heartline_core::config::DialogueConfig;
use heartline_core::scenario::ScenarioRule;
use heartline_core::sentiment::affection_heuristic;
use heartline_core::{
    Choice, ChoiceGate, ConversationSession, Message, Mood, PersonaProfile, RelationshipDelta, RelationshipState,
    Summarizer,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Everything one generation reads.
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    pub session: &'a ConversationSession,
    pub relationship: &'a RelationshipState,
    pub persona: &'a PersonaProfile,
    /// Session tail in sequence order, excluding the new input.
    pub recent: &'a [Message],
    pub user_input: &'a str,
    /// The already authorized choice the user picked, if any.
    pub selected: Option<&'a Choice>,
    /// Active scenario scene, if any.
    pub scenario: Option<&'a ScenarioRule>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DialogueOutput {
    pub utterance: String,
    pub emotion: Mood,
    pub inner_thought: Option<String>,
    pub choices: Vec<Choice>,
    pub delta: RelationshipDelta,
    pub end_scene: bool,
    /// Why the filler line was used, when it was.
    pub degraded: Option<String>,
}

impl DialogueOutput {
    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }
}

pub struct DialogueEngine {
    client: Arc<dyn LlmClient>,
    config: DialogueConfig,
    params: CompletionParams,
    retry: RetryConfig,
}

impl DialogueEngine {
    pub fn new(client: Arc<dyn LlmClient>, config: DialogueConfig, params: CompletionParams) -> Self {
        let retry = RetryConfig::from(&config);
        Self {
            client,
            config,
            params,
            retry,
        }
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    /// Generate the persona's reply. Never fails: exhausted retries or an
    /// exceeded turn budget produce the persona's filler line with zero delta.
    pub async fn generate(&self, req: &GenerationRequest<'_>) -> DialogueOutput {
        let system =
            ContextAssembler::build_system_prompt(req.persona, req.relationship, req.session, req.scenario);
        let messages = ContextAssembler::build_messages(req.recent, req.user_input);

        match tokio::time::timeout(self.config.turn_budget(), self.complete_with_retries(&system, messages)).await {
            Ok(Ok(reply)) => self.finish(reply, req),
            Ok(Err(e)) => self.degraded(req, format!("{:#}", e)),
            Err(_) => self.degraded(req, "turn budget exceeded".to_string()),
        }
    }

    async fn complete_with_retries(&self, system: &str, messages: Vec<ChatMessage>) -> anyhow::Result<GeneratedReply> {
        let mut last_error = String::from("no attempts made");

        for attempt in 1..=self.retry.max_attempts {
            let call = self.client.complete(system, messages.clone(), self.params);
            match tokio::time::timeout(self.config.attempt_timeout(), call).await {
                Ok(Ok(resp)) => match parse_reply(&resp.text) {
                    Some(reply) => return Ok(reply),
                    None => {
                        tracing::warn!("Unusable completion on attempt {}/{}", attempt, self.retry.max_attempts);
                        last_error = "unusable completion".to_string();
                    }
                },
                Ok(Err(e)) => {
                    tracing::warn!(
                        "LLM call failed on attempt {}/{}: {:#}",
                        attempt,
                        self.retry.max_attempts,
                        e
                    );
                    last_error = format!("{:#}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        "LLM call timed out after {:?} on attempt {}/{}",
                        self.config.attempt_timeout(),
                        attempt,
                        self.retry.max_attempts
                    );
                    last_error = "attempt timed out".to_string();
                }
            }

            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        anyhow::bail!("{} attempts failed, last: {}", self.retry.max_attempts, last_error)
    }

    fn finish(&self, reply: GeneratedReply, req: &GenerationRequest<'_>) -> DialogueOutput {
        let emotion = reply
            .emotion
            .as_deref()
            .map(Mood::parse_or_neutral)
            .unwrap_or(Mood::Neutral);
        let delta = derive_delta(&reply, req.selected, req.user_input, &self.config);
        let choices = normalize_choices(
            reply.choices,
            self.config.max_choices,
            self.config.max_affection_delta,
        );
        let inner_thought = reply
            .inner_thought
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty() && t != "null");

        tracing::debug!(
            "Generated reply for session {}: emotion={}, {} choices, delta={:?}",
            req.session.id,
            emotion,
            choices.len(),
            delta
        );
        DialogueOutput {
            utterance: reply.reply,
            emotion,
            inner_thought,
            choices,
            delta,
            end_scene: reply.end_scene,
            degraded: None,
        }
    }

    fn degraded(&self, req: &GenerationRequest<'_>, reason: String) -> DialogueOutput {
        tracing::warn!("Generation degraded for session {}: {}", req.session.id, reason);
        DialogueOutput {
            utterance: req.persona.filler_line(req.session.last_sequence as usize).to_string(),
            emotion: req.session.emotional_state.mood,
            inner_thought: None,
            choices: Vec::new(),
            delta: RelationshipDelta::default(),
            end_scene: false,
            degraded: Some(reason),
        }
    }
}

#[async_trait]
impl Summarizer for DialogueEngine {
    async fn summarize(&self, previous_summary: &str, messages: &[Message]) -> anyhow::Result<String> {
        let request = ContextAssembler::build_summary_request(previous_summary, messages, None);
        let params = CompletionParams {
            max_tokens: 400,
            temperature: 0.3,
        };
        let call = self
            .client
            .complete(SUMMARY_SYSTEM_PROMPT, vec![ChatMessage::user(request)], params);
        let resp = tokio::time::timeout(self.config.attempt_timeout(), call)
            .await
            .context("Summary request timed out")??;
        let summary = resp.text.trim();
        anyhow::ensure!(!summary.is_empty(), "Summarizer returned an empty summary");
        Ok(summary.to_string())
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Per-turn relationship delta.
///
/// Affection comes from the model's suggestion, else the selected choice's
/// hint, else the sentiment heuristic of the input. Trust and intimacy only
/// move when the model suggests it.
pub fn derive_delta(
    reply: &GeneratedReply,
    selected: Option<&Choice>,
    user_input: &str,
    cfg: &DialogueConfig,
) -> RelationshipDelta {
    let affection = reply
        .affection_delta
        .or_else(|| selected.map(|c| c.affection_hint))
        .unwrap_or_else(|| affection_heuristic(user_input));
    let bound = cfg.max_trust_delta.abs();
    RelationshipDelta {
        affection: clamp_symmetric(affection, cfg.max_affection_delta),
        trust: clamp_symmetric(reply.trust_delta.unwrap_or(0), bound),
        intimacy: clamp_symmetric(reply.intimacy_delta.unwrap_or(0), bound),
    }
}

/// Delta for a scripted turn, which has no model suggestion.
pub fn scripted_delta(selected: Option<&Choice>, user_input: &str, cfg: &DialogueConfig) -> RelationshipDelta {
    derive_delta(&GeneratedReply::default(), selected, user_input, cfg)
}

fn clamp_symmetric(value: i32, bound: i32) -> i32 {
    let bound = bound.abs();
    value.clamp(-bound, bound)
}

/// Clean up proposed choices: drop blank and duplicate texts, cap the count,
/// number them `c1..cN`, clamp hints and guarantee one free option.
pub fn normalize_choices(raw: Vec<GeneratedChoice>, max_choices: usize, max_hint: i32) -> Vec<Choice> {
    let mut seen = HashSet::new();
    let mut choices: Vec<Choice> = raw
        .into_iter()
        .filter_map(|c| {
            let text = c.text.trim().to_string();
            (!text.is_empty() && seen.insert(text.to_lowercase())).then_some((text, c))
        })
        .take(max_choices)
        .enumerate()
        .map(|(i, (text, c))| Choice {
            id: format!("c{}", i + 1),
            text,
            tone: c.tone.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            is_premium: c.is_premium,
            affection_hint: clamp_symmetric(c.affection_hint.unwrap_or(0), max_hint),
            next_scene: None,
        })
        .collect();
    ChoiceGate::ensure_free_choice(&mut choices);
    choices
}
