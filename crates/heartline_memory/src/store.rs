//! Persistence collaborator: sessions, messages and relationships with
//! version tokens.

use async_trait::async_trait;
use heartline_core::{ChatError, ConversationSession, Message, RelationshipState};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Version token mismatch, or a uniqueness race lost.
    #[error("{resource} was modified concurrently")]
    Conflict { resource: &'static str },

    #[error("{0} not found")]
    NotFound(String),

    #[error("choice '{choice_id}' cannot be selected on message {message_id}")]
    InvalidSelection { message_id: Uuid, choice_id: String },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    /// Map to the turn-boundary taxonomy. `attempts` is how many tries
    /// were spent before giving up on a conflict.
    pub fn into_chat_error(self, attempts: u32) -> ChatError {
        match self {
            StoreError::Conflict { resource } => ChatError::ConcurrentUpdateConflict {
                resource: resource.to_string(),
                attempts,
            },
            StoreError::NotFound(what) => ChatError::InvalidRequest(format!("{} not found", what)),
            StoreError::InvalidSelection {
                message_id,
                choice_id,
            } => ChatError::InvalidChoiceSelection {
                choice_id,
                message_id: Some(message_id),
            },
            StoreError::Backend(e) => ChatError::Internal(e),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(e: StoreError) -> Self {
        e.into_chat_error(1)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Everything one turn persists, written atomically.
#[derive(Debug, Clone)]
pub struct TurnCommit {
    /// Post-turn session state. `version` must equal the stored version.
    pub session: ConversationSession,
    /// New messages in order, sequence numbers unassigned.
    pub messages: Vec<Message>,
    /// Post-turn relationship, compare-and-swapped on its own version.
    pub relationship: Option<RelationshipState>,
    /// (message id, choice id) to record on an earlier assistant message.
    pub selection: Option<(Uuid, String)>,
}

#[derive(Debug, Clone)]
pub struct TurnReceipt {
    pub session: ConversationSession,
    /// The committed messages with their sequence numbers.
    pub messages: Vec<Message>,
    pub relationship: Option<RelationshipState>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn active_session(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<ConversationSession>>;

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ConversationSession>>;

    /// Insert a new active session. Fails with `Conflict` when the pair
    /// already has an active session.
    async fn create_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession>;

    /// Archive the active session of the pair, if any. Returns its id.
    async fn archive_active(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<Uuid>>;

    /// Compare-and-swap update; returns the stored row with its new version.
    async fn update_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession>;

    /// Mark inactive. Returns false when it was already ended.
    async fn end_session(&self, session_id: Uuid) -> StoreResult<bool>;

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>>;

    /// The newest `limit` messages, oldest first.
    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> StoreResult<Vec<Message>>;

    /// Messages with `after < sequence_number <= through`, oldest first.
    async fn messages_range(&self, session_id: Uuid, after: u64, through: u64) -> StoreResult<Vec<Message>>;

    async fn latest_assistant_message(&self, session_id: Uuid) -> StoreResult<Option<Message>>;

    async fn commit_turn(&self, commit: &TurnCommit) -> StoreResult<TurnReceipt>;

    async fn get_relationship(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<RelationshipState>>;

    /// Insert when `version == 0`, otherwise compare-and-swap.
    async fn put_relationship(&self, state: &RelationshipState) -> StoreResult<RelationshipState>;
}

/// Assign sequence numbers after `last_sequence`, in order.
pub(crate) fn sequence_messages(messages: &[Message], session_id: Uuid, last_sequence: u64) -> Vec<Message> {
    messages
        .iter()
        .enumerate()
        .map(|(i, m)| Message {
            session_id,
            sequence_number: last_sequence + 1 + i as u64,
            ..m.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_maps_to_transient_chat_error() {
        let err = StoreError::Conflict {
            resource: "session",
        }
        .into_chat_error(3);
        assert!(err.is_transient());
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn test_invalid_selection_maps_to_invalid_choice() {
        let id = Uuid::new_v4();
        let err: ChatError = StoreError::InvalidSelection {
            message_id: id,
            choice_id: "c9".into(),
        }
        .into();
        assert_eq!(err.code(), "invalid_choice");
    }

    #[test]
    fn test_sequence_messages_is_gap_free() {
        let sid = Uuid::new_v4();
        let msgs = vec![Message::user(sid, "a"), Message::user(sid, "b")];
        let seq = sequence_messages(&msgs, sid, 7);
        assert_eq!(seq.iter().map(|m| m.sequence_number).collect::<Vec<_>>(), [8, 9]);
    }
}
