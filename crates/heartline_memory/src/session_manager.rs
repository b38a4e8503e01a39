//! SessionManager: one active session per (user, persona), the turn log and
//! the rolling summary schedule.

use crate::store::{ConversationStore, StoreError, StoreResult, TurnCommit, TurnReceipt};
use crate::tracker::validate_identifier;
use chrono::Utc;
use heartline_core::config::SessionConfig;
use heartline_core::{
    ChatError, ChatResult, ConversationSession, Message, PersonaDirectory, PersonaProfile, ScriptLibrary,
    Summarizer,
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ResolvedSession {
    pub session: ConversationSession,
    pub persona: PersonaProfile,
    pub created: bool,
}

pub struct SessionManager {
    store: Arc<dyn ConversationStore>,
    personas: Arc<dyn PersonaDirectory>,
    scripts: Arc<ScriptLibrary>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        personas: Arc<dyn PersonaDirectory>,
        scripts: Arc<ScriptLibrary>,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            personas,
            scripts,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn scripts(&self) -> &ScriptLibrary {
        &self.scripts
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Look up a persona. Unknown ids cannot start a chat.
    pub async fn persona(&self, persona_id: &str) -> ChatResult<PersonaProfile> {
        validate_identifier("personaId", persona_id)?;
        match self.personas.persona(persona_id).await {
            Ok(Some(p)) => Ok(p),
            Ok(None) => {
                tracing::info!("Unknown persona '{}'", persona_id);
                Err(ChatError::SessionNotResumable(format!("unknown persona {}", persona_id)))
            }
            Err(e) => {
                tracing::error!("Persona directory failed for '{}': {:#}", persona_id, e);
                Err(ChatError::SessionNotResumable(format!("persona {} unavailable", persona_id)))
            }
        }
    }

    /// Return the active session for the pair, creating one if needed.
    pub async fn resolve_or_create(&self, user_id: &str, persona_id: &str) -> ChatResult<ResolvedSession> {
        validate_identifier("userId", user_id)?;
        let persona = self.persona(persona_id).await?;

        if let Some(session) = self.store.active_session(user_id, persona_id).await? {
            return Ok(ResolvedSession {
                session,
                persona,
                created: false,
            });
        }

        let fresh = self.new_session(user_id, persona_id).await?;
        match self.store.create_session(&fresh).await {
            Ok(session) => {
                tracing::info!("Created session {} for {}/{}", session.id, user_id, persona_id);
                Ok(ResolvedSession {
                    session,
                    persona,
                    created: true,
                })
            }
            // Lost the creation race; use the winner's session
            Err(StoreError::Conflict { .. }) => {
                let session = self
                    .store
                    .active_session(user_id, persona_id)
                    .await?
                    .ok_or_else(|| ChatError::SessionNotResumable("session vanished during creation".into()))?;
                Ok(ResolvedSession {
                    session,
                    persona,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the session named by the client, falling back to the active
    /// session when none is given or the named one has been archived.
    pub async fn resolve(
        &self,
        user_id: &str,
        persona_id: &str,
        session_id: Option<Uuid>,
    ) -> ChatResult<ResolvedSession> {
        if let Some(id) = session_id {
            let session = self.owned_session(id, user_id).await?;
            if session.persona_id != persona_id {
                return Err(ChatError::InvalidRequest(format!(
                    "session {} does not belong to persona {}",
                    id, persona_id
                )));
            }
            if session.active {
                let persona = self.persona(persona_id).await?;
                return Ok(ResolvedSession {
                    session,
                    persona,
                    created: false,
                });
            }
            tracing::debug!("Session {} is archived, resolving the active one", id);
        }
        self.resolve_or_create(user_id, persona_id).await
    }

    /// Explicit session start: archives the current session and opens a new one.
    pub async fn start_session(&self, user_id: &str, persona_id: &str) -> ChatResult<ResolvedSession> {
        validate_identifier("userId", user_id)?;
        let persona = self.persona(persona_id).await?;
        let attempts = self.config.commit_retries.max(1);
        for attempt in 1..=attempts {
            if let Some(old) = self.store.archive_active(user_id, persona_id).await? {
                tracing::info!("Archived session {} for {}/{}", old, user_id, persona_id);
            }
            let fresh = self.new_session(user_id, persona_id).await?;
            match self.store.create_session(&fresh).await {
                Ok(session) => {
                    return Ok(ResolvedSession {
                        session,
                        persona,
                        created: true,
                    })
                }
                Err(StoreError::Conflict { .. }) if attempt < attempts => continue,
                Err(e) => return Err(e.into_chat_error(attempt)),
            }
        }
        Err(ChatError::ConcurrentUpdateConflict {
            resource: "session".into(),
            attempts,
        })
    }

    /// Brand-new pairs start inside the onboarding script when one is loaded.
    async fn new_session(&self, user_id: &str, persona_id: &str) -> ChatResult<ConversationSession> {
        let mut session = ConversationSession::new(user_id, persona_id, Utc::now());
        let first_contact = self.store.get_relationship(user_id, persona_id).await?.is_none();
        if first_contact {
            if let Some(script) = self
                .config
                .onboarding_script
                .as_deref()
                .and_then(|id| self.scripts.get(id))
            {
                session.current_episode = Some(script.id.clone());
                session.current_scene = script.start.clone();
            }
        }
        Ok(session)
    }

    /// Fetch a session and check it belongs to `user_id`.
    pub async fn owned_session(&self, session_id: Uuid, user_id: &str) -> ChatResult<ConversationSession> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| ChatError::InvalidRequest(format!("session {} not found", session_id)))?;
        if session.user_id != user_id {
            // Same answer as a missing session; ids are not confirmed to strangers
            return Err(ChatError::InvalidRequest(format!("session {} not found", session_id)));
        }
        Ok(session)
    }

    pub async fn recent_messages(&self, session_id: Uuid, limit: usize) -> ChatResult<Vec<Message>> {
        Ok(self.store.recent_messages(session_id, limit).await?)
    }

    /// Persist one turn atomically. Conflicts are returned as-is so the
    /// caller can rebuild the turn on fresh state.
    pub async fn append_turn(&self, commit: &TurnCommit) -> StoreResult<TurnReceipt> {
        self.store.commit_turn(commit).await
    }

    pub async fn update_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession> {
        self.store.update_session(session).await
    }

    /// Fold older messages into the rolling summary when the unsummarized
    /// window is long enough. Never fails the turn.
    pub async fn maybe_summarize(
        &self,
        session: &ConversationSession,
        summarizer: &dyn Summarizer,
    ) -> Option<ConversationSession> {
        let through = session.last_sequence.saturating_sub(self.config.keep_recent as u64);
        if through <= session.summarized_through {
            return None;
        }

        let window = match self
            .store
            .messages_range(session.id, session.summarized_through, through)
            .await
        {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("Could not load summary window for {}: {}", session.id, e);
                return None;
            }
        };
        let chars: usize = window.iter().map(|m| m.content.chars().count()).sum();
        let due = session.unsummarized_count() >= self.config.summary_interval
            || chars > self.config.summary_char_budget;
        if !due || window.is_empty() {
            return None;
        }

        let summary = match summarizer.summarize(&session.context_summary, &window).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Summarization failed for session {}: {:#}", session.id, e);
                return None;
            }
        };

        let updated = ConversationSession {
            context_summary: summary,
            summarized_through: through,
            ..session.clone()
        };
        match self.store.update_session(&updated).await {
            Ok(stored) => {
                tracing::debug!(
                    "Session {} summarized through seq {} ({} messages, {} chars)",
                    session.id,
                    through,
                    window.len(),
                    chars
                );
                Some(stored)
            }
            Err(e) => {
                // A newer turn landed first; the next turn retries
                tracing::debug!("Skipped summary write for {}: {}", session.id, e);
                None
            }
        }
    }

    /// Archive a session. Idempotent: ending an ended session returns false.
    pub async fn end_session(&self, session_id: Uuid, user_id: &str) -> ChatResult<bool> {
        self.owned_session(session_id, user_id).await?;
        let ended = self.store.end_session(session_id).await?;
        if ended {
            tracing::info!("Ended session {}", session_id);
        }
        Ok(ended)
    }

    /// User-facing history: ordered, inner thoughts redacted.
    pub async fn history(&self, session_id: Uuid, user_id: &str) -> ChatResult<Vec<Message>> {
        self.owned_session(session_id, user_id).await?;
        let messages = self.store.messages_range(session_id, 0, u64::MAX).await?;
        Ok(messages.iter().map(Message::redacted).collect())
    }

    /// Full history including inner thoughts, for operators.
    pub async fn history_for_admin(&self, session_id: Uuid) -> ChatResult<Vec<Message>> {
        Ok(self.store.messages_range(session_id, 0, u64::MAX).await?)
    }
}
