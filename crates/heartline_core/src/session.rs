//! Conversation sessions and their append-only message log.

use crate::choice::Choice;
use crate::emotion::{EmotionalState, Mood};
use crate::error::ChatError;
use crate::scenario::ScenarioType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Scene pointer for plain DM chat outside any script or scenario.
pub const DEFAULT_SCENE: &str = "freeform";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSession {
    pub id: Uuid,
    pub user_id: String,
    pub persona_id: String,
    pub current_scene: String,
    /// Script or scenario episode the session is inside, if any.
    pub current_episode: Option<String>,
    pub emotional_state: EmotionalState,
    /// Rolling digest of everything up to `summarized_through`.
    pub context_summary: String,
    pub summarized_through: u64,
    /// Highest sequence number persisted so far (0 = no messages).
    pub last_sequence: u64,
    pub offered_scenarios: BTreeSet<ScenarioType>,
    pub declined_scenarios: BTreeSet<ScenarioType>,
    pub active: bool,
    pub started_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, bumped on every write.
    pub version: u64,
}

impl ConversationSession {
    pub fn new(user_id: &str, persona_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            persona_id: persona_id.to_string(),
            current_scene: DEFAULT_SCENE.to_string(),
            current_episode: None,
            emotional_state: EmotionalState::neutral(),
            context_summary: String::new(),
            summarized_through: 0,
            last_sequence: 0,
            offered_scenarios: BTreeSet::new(),
            declined_scenarios: BTreeSet::new(),
            active: true,
            started_at: now,
            last_message_at: now,
            ended_at: None,
            version: 0,
        }
    }

    pub fn message_count(&self) -> u64 {
        self.last_sequence
    }

    /// Messages not yet folded into the summary.
    pub fn unsummarized_count(&self) -> u64 {
        self.last_sequence.saturating_sub(self.summarized_through)
    }

    pub fn is_freeform(&self) -> bool {
        self.current_episode.is_none()
    }

    /// Leave any script or scenario and return to DM chat.
    pub fn return_to_freeform(&mut self) {
        self.current_episode = None;
        self.current_scene = DEFAULT_SCENE.to_string();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(raw: &str) -> Option<Role> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub emotion: Option<Mood>,
    /// Assistant only. Redacted from user-facing history.
    #[serde(default)]
    pub inner_thought: Option<String>,
    #[serde(default)]
    pub choices_presented: Vec<Choice>,
    #[serde(default)]
    pub choice_selected: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Assigned at commit time; 0 until persisted.
    pub sequence_number: u64,
}

impl Message {
    fn base(session_id: Uuid, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role,
            content: content.into(),
            emotion: None,
            inner_thought: None,
            choices_presented: Vec::new(),
            choice_selected: None,
            created_at: Utc::now(),
            sequence_number: 0,
        }
    }

    pub fn user(session_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(session_id, Role::User, content)
    }

    pub fn system(session_id: Uuid, content: impl Into<String>) -> Self {
        Self::base(session_id, Role::System, content)
    }

    pub fn assistant(
        session_id: Uuid,
        content: impl Into<String>,
        emotion: Mood,
        inner_thought: Option<String>,
        choices: Vec<Choice>,
    ) -> Self {
        Self {
            emotion: Some(emotion),
            inner_thought,
            choices_presented: choices,
            ..Self::base(session_id, Role::Assistant, content)
        }
    }

    pub fn find_choice(&self, choice_id: &str) -> Option<&Choice> {
        self.choices_presented.iter().find(|c| c.id == choice_id)
    }

    /// Validate a selection against this message's own presented choices.
    pub fn validate_selection(&self, choice_id: &str) -> Result<&Choice, ChatError> {
        let invalid = || ChatError::InvalidChoiceSelection {
            choice_id: choice_id.to_string(),
            message_id: Some(self.id),
        };
        if self.role != Role::Assistant || self.choice_selected.is_some() {
            return Err(invalid());
        }
        self.find_choice(choice_id).ok_or_else(invalid)
    }

    /// Record the selection. Only ever set once.
    pub fn select_choice(&mut self, choice_id: &str) -> Result<(), ChatError> {
        self.validate_selection(choice_id)?;
        self.choice_selected = Some(choice_id.to_string());
        Ok(())
    }

    /// Copy without the persona's inner thought.
    pub fn redacted(&self) -> Message {
        Message {
            inner_thought: None,
            ..self.clone()
        }
    }
}
