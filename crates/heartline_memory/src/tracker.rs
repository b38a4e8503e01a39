//! RelationshipTracker: lazily created gauges per (user, persona), written
//! with compare-and-swap and retried on conflict.

use crate::store::{ConversationStore, StoreError};
use chrono::Utc;
use heartline_core::{
    ChatError, ChatResult, RelationshipDelta, RelationshipState, StageTable, StageTransition,
};
use serde::Deserialize;
use std::sync::Arc;

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_NICKNAME_CHARS: usize = 32;

/// Reject empty, oversized or control-character identifiers.
pub fn validate_identifier(kind: &str, raw: &str) -> ChatResult<()> {
    if raw.trim().is_empty() {
        return Err(ChatError::InvalidRequest(format!("{} must not be empty", kind)));
    }
    if raw.len() > MAX_IDENTIFIER_LEN || raw.chars().any(char::is_control) {
        return Err(ChatError::InvalidRequest(format!("{} is not a valid identifier", kind)));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DeltaOutcome {
    pub state: RelationshipState,
    pub stage_changed: Option<StageTransition>,
}

/// `None` leaves a nickname unchanged; an empty string clears it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicknameUpdate {
    pub persona_nickname: Option<String>,
    pub user_nickname: Option<String>,
}

fn normalize_nickname(raw: &str) -> ChatResult<Option<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_NICKNAME_CHARS {
        return Err(ChatError::InvalidRequest(format!(
            "nickname must be at most {} characters",
            MAX_NICKNAME_CHARS
        )));
    }
    Ok(Some(trimmed.to_string()))
}

pub struct RelationshipTracker {
    store: Arc<dyn ConversationStore>,
    table: StageTable,
    cas_retries: u32,
}

impl RelationshipTracker {
    pub fn new(store: Arc<dyn ConversationStore>, table: StageTable, cas_retries: u32) -> Self {
        Self {
            store,
            table,
            cas_retries: cas_retries.max(1),
        }
    }

    pub fn table(&self) -> &StageTable {
        &self.table
    }

    /// Current state, or a fresh stranger state when none is stored yet.
    pub async fn get(&self, user_id: &str, persona_id: &str) -> ChatResult<RelationshipState> {
        validate_identifier("userId", user_id)?;
        validate_identifier("personaId", persona_id)?;
        Ok(self
            .store
            .get_relationship(user_id, persona_id)
            .await?
            .unwrap_or_else(|| RelationshipState::new(user_id, persona_id, Utc::now())))
    }

    pub async fn apply_delta(
        &self,
        user_id: &str,
        persona_id: &str,
        delta: RelationshipDelta,
    ) -> ChatResult<DeltaOutcome> {
        let table = &self.table;
        let (state, stage_changed) = self
            .update_with(user_id, persona_id, |state| {
                state.apply_delta(&delta, table, Utc::now())
            })
            .await?;
        if let Some(t) = &stage_changed {
            tracing::info!(
                "Relationship {}/{} advanced {} -> {}",
                user_id,
                persona_id,
                t.from,
                t.to
            );
        }
        Ok(DeltaOutcome {
            state,
            stage_changed,
        })
    }

    /// Lower gauges without touching the reached stage.
    pub async fn apply_penalty(
        &self,
        user_id: &str,
        persona_id: &str,
        delta: RelationshipDelta,
    ) -> ChatResult<RelationshipState> {
        let (state, _) = self
            .update_with(user_id, persona_id, |state| state.apply_penalty(&delta, Utc::now()))
            .await?;
        Ok(state)
    }

    pub async fn set_nicknames(
        &self,
        user_id: &str,
        persona_id: &str,
        update: NicknameUpdate,
    ) -> ChatResult<RelationshipState> {
        let persona_nickname = update.persona_nickname.as_deref().map(normalize_nickname).transpose()?;
        let user_nickname = update.user_nickname.as_deref().map(normalize_nickname).transpose()?;
        let (state, _) = self
            .update_with(user_id, persona_id, |state| {
                if let Some(nick) = &persona_nickname {
                    state.persona_nickname = nick.clone();
                }
                if let Some(nick) = &user_nickname {
                    state.user_nickname = nick.clone();
                }
            })
            .await?;
        Ok(state)
    }

    /// Read-modify-write with compare-and-swap, re-reading on conflict.
    pub async fn update_with<F, T>(
        &self,
        user_id: &str,
        persona_id: &str,
        mutate: F,
    ) -> ChatResult<(RelationshipState, T)>
    where
        F: Fn(&mut RelationshipState) -> T + Send + Sync,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut state = self.get(user_id, persona_id).await?;
            let out = mutate(&mut state);
            match self.store.put_relationship(&state).await {
                Ok(stored) => return Ok((stored, out)),
                Err(StoreError::Conflict { resource }) if attempt < self.cas_retries => {
                    tracing::debug!(
                        "{} CAS conflict for {}/{} (attempt {}), retrying",
                        resource,
                        user_id,
                        persona_id,
                        attempt
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => {
                    if e.is_conflict() {
                        tracing::warn!(
                            "Relationship {}/{} still conflicting after {} attempts",
                            user_id,
                            persona_id,
                            attempt
                        );
                    }
                    return Err(e.into_chat_error(attempt));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryStore;
    use heartline_core::RelationshipStage;

    fn tracker() -> RelationshipTracker {
        RelationshipTracker::new(Arc::new(InMemoryStore::new()), StageTable::default(), 5)
    }

    #[tokio::test]
    async fn test_get_is_lazy_stranger() {
        let t = tracker();
        let s = t.get("u1", "luna").await.unwrap();
        assert_eq!(s.stage, RelationshipStage::Stranger);
        assert_eq!(s.affection, 0);
        assert_eq!(s.version, 0);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let t = tracker();
        assert!(matches!(t.get("", "luna").await, Err(ChatError::InvalidRequest(_))));
        let long = "x".repeat(300);
        assert!(t.apply_delta("u1", &long, RelationshipDelta::affection(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_five_small_deltas_from_fresh_state() {
        let t = tracker();
        for d in [3, 5, 2, 7, 4] {
            t.apply_delta("u1", "luna", RelationshipDelta::affection(d)).await.unwrap();
        }
        let s = t.get("u1", "luna").await.unwrap();
        assert!(s.affection > 0);
        assert_eq!(s.message_count, 5);
        assert!(matches!(
            s.stage,
            RelationshipStage::Stranger | RelationshipStage::Acquaintance
        ));
    }

    #[tokio::test]
    async fn test_stage_change_reported() {
        let t = tracker();
        let mut changes = Vec::new();
        for _ in 0..4 {
            let out = t
                .apply_delta("u1", "luna", RelationshipDelta::affection(10))
                .await
                .unwrap();
            changes.extend(out.stage_changed);
        }
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, RelationshipStage::Acquaintance);
    }

    #[tokio::test]
    async fn test_nicknames_set_and_clear() {
        let t = tracker();
        let s = t
            .set_nicknames(
                "u1",
                "luna",
                NicknameUpdate {
                    persona_nickname: Some("  Lu ".into()),
                    user_nickname: Some("sunshine".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(s.persona_nickname.as_deref(), Some("Lu"));
        assert_eq!(s.user_nickname.as_deref(), Some("sunshine"));

        let s = t
            .set_nicknames(
                "u1",
                "luna",
                NicknameUpdate {
                    persona_nickname: Some(String::new()),
                    user_nickname: None,
                },
            )
            .await
            .unwrap();
        assert!(s.persona_nickname.is_none());
        assert_eq!(s.user_nickname.as_deref(), Some("sunshine"));
    }

    #[tokio::test]
    async fn test_nickname_too_long() {
        let t = tracker();
        let err = t
            .set_nicknames(
                "u1",
                "luna",
                NicknameUpdate {
                    persona_nickname: Some("a".repeat(40)),
                    user_nickname: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_concurrent_deltas_both_applied() {
        let t = Arc::new(tracker());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let t = t.clone();
            handles.push(tokio::spawn(async move {
                t.apply_delta("u1", "luna", RelationshipDelta::affection(4)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let s = t.get("u1", "luna").await.unwrap();
        assert_eq!(s.affection, 8);
        assert_eq!(s.message_count, 2);
    }

    #[tokio::test]
    async fn test_penalty_keeps_stage() {
        let t = tracker();
        for _ in 0..4 {
            t.apply_delta("u1", "luna", RelationshipDelta::affection(10)).await.unwrap();
        }
        let s = t
            .apply_penalty("u1", "luna", RelationshipDelta::affection(50))
            .await
            .unwrap();
        assert_eq!(s.affection, 0);
        assert_eq!(s.stage, RelationshipStage::Acquaintance);
    }
}
