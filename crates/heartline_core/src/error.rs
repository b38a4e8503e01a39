//! Error taxonomy surfaced at the chat-turn boundary.
//!
//! Paywall hits and degraded generations are *outcomes*, not errors, and are
//! therefore not represented here.

use thiserror::Error;
use uuid::Uuid;

/// Machine-readable codes used on the wire.
pub mod codes {
    pub const CANNOT_START_CHAT: &str = "cannot_start_chat";
    pub const INVALID_CHOICE: &str = "invalid_choice";
    pub const CONFLICT: &str = "conflict";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const INTERNAL_ERROR: &str = "internal_error";
}

#[derive(Debug, Error)]
pub enum ChatError {
    /// Persona id unknown or session corrupted.
    #[error("cannot start chat: {0}")]
    SessionNotResumable(String),

    /// Optimistic-concurrency retries were exhausted.
    #[error("concurrent update conflict on {resource} after {attempts} attempts")]
    ConcurrentUpdateConflict { resource: String, attempts: u32 },

    /// `choiceSelected` does not reference a presented choice.
    #[error("choice '{choice_id}' is not a valid selection")]
    InvalidChoiceSelection {
        choice_id: String,
        message_id: Option<Uuid>,
    },

    /// Malformed payload or unknown identifiers.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::SessionNotResumable(_) => codes::CANNOT_START_CHAT,
            ChatError::ConcurrentUpdateConflict { .. } => codes::CONFLICT,
            ChatError::InvalidChoiceSelection { .. } => codes::INVALID_CHOICE,
            ChatError::InvalidRequest(_) => codes::INVALID_REQUEST,
            ChatError::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Message safe to show to an end user. Never includes provider or
    /// database details.
    pub fn public_message(&self) -> String {
        match self {
            ChatError::SessionNotResumable(_) => "Cannot start chat right now.".to_string(),
            ChatError::ConcurrentUpdateConflict { .. } => {
                "Another message is still being processed, please try again.".to_string()
            }
            ChatError::InvalidChoiceSelection { choice_id, .. } => {
                format!("Choice '{}' is not available for this message.", choice_id)
            }
            ChatError::InvalidRequest(msg) => msg.clone(),
            ChatError::Internal(_) => "Something went wrong, please try again.".to_string(),
        }
    }

    /// Transient errors the client may simply retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::ConcurrentUpdateConflict { .. } | ChatError::Internal(_)
        )
    }
}

pub type ChatResult<T> = std::result::Result<T, ChatError>;
