//! In-process store with the same version semantics as the SQLite store.
//! Backs unit tests and `--ephemeral` runs.

use crate::store::{sequence_messages, ConversationStore, StoreError, StoreResult, TurnCommit, TurnReceipt};
use async_trait::async_trait;
use chrono::Utc;
use heartline_core::{ConversationSession, Message, RelationshipState, Role};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    sessions: HashMap<Uuid, ConversationSession>,
    messages: HashMap<Uuid, Vec<Message>>,
    relationships: HashMap<(String, String), RelationshipState>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_relationship(tables: &Tables, state: &RelationshipState) -> StoreResult<()> {
    let key = (state.user_id.clone(), state.persona_id.clone());
    let stored_version = tables.relationships.get(&key).map(|r| r.version);
    match (state.version, stored_version) {
        (0, None) => Ok(()),
        (v, Some(stored)) if v == stored => Ok(()),
        _ => Err(StoreError::Conflict {
            resource: "relationship",
        }),
    }
}

fn write_relationship(tables: &mut Tables, state: &RelationshipState) -> RelationshipState {
    let stored = RelationshipState {
        version: state.version + 1,
        ..state.clone()
    };
    tables.relationships.insert(
        (state.user_id.clone(), state.persona_id.clone()),
        stored.clone(),
    );
    stored
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn active_session(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<ConversationSession>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .find(|s| s.active && s.user_id == user_id && s.persona_id == persona_id)
            .cloned())
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ConversationSession>> {
        Ok(self.tables.lock().await.sessions.get(&session_id).cloned())
    }

    async fn create_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession> {
        let mut tables = self.tables.lock().await;
        let taken = tables
            .sessions
            .values()
            .any(|s| s.active && s.user_id == session.user_id && s.persona_id == session.persona_id);
        if taken || tables.sessions.contains_key(&session.id) {
            return Err(StoreError::Conflict { resource: "session" });
        }
        let stored = ConversationSession {
            version: 1,
            active: true,
            ..session.clone()
        };
        tables.sessions.insert(stored.id, stored.clone());
        tables.messages.insert(stored.id, Vec::new());
        Ok(stored)
    }

    async fn archive_active(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<Uuid>> {
        let mut tables = self.tables.lock().await;
        let active = tables
            .sessions
            .values_mut()
            .find(|s| s.active && s.user_id == user_id && s.persona_id == persona_id);
        Ok(active.map(|s| {
            s.active = false;
            s.ended_at = Some(Utc::now());
            s.version += 1;
            s.id
        }))
    }

    async fn update_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        if stored.version != session.version || !stored.active {
            return Err(StoreError::Conflict { resource: "session" });
        }
        *stored = ConversationSession {
            version: session.version + 1,
            // Activity and message bookkeeping only change through their own paths
            active: stored.active,
            ended_at: stored.ended_at,
            last_sequence: stored.last_sequence,
            ..session.clone()
        };
        Ok(stored.clone())
    }

    async fn end_session(&self, session_id: Uuid) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        if !stored.active {
            return Ok(false);
        }
        stored.active = false;
        stored.ended_at = Some(Utc::now());
        stored.version += 1;
        Ok(true)
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .values()
            .flat_map(|msgs| msgs.iter())
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock().await;
        let msgs = tables.messages.get(&session_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = msgs.len().saturating_sub(limit);
        Ok(msgs[start..].to_vec())
    }

    async fn messages_range(&self, session_id: Uuid, after: u64, through: u64) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .get(&session_id)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.sequence_number > after && m.sequence_number <= through)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_assistant_message(&self, session_id: Uuid) -> StoreResult<Option<Message>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .messages
            .get(&session_id)
            .and_then(|msgs| msgs.iter().rev().find(|m| m.role == Role::Assistant).cloned()))
    }

    async fn commit_turn(&self, commit: &TurnCommit) -> StoreResult<TurnReceipt> {
        let mut tables = self.tables.lock().await;
        let session_id = commit.session.id;

        // Validate everything before touching any table
        let stored = tables
            .sessions
            .get(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
        if stored.version != commit.session.version || !stored.active {
            return Err(StoreError::Conflict { resource: "session" });
        }
        let last_sequence = stored.last_sequence;
        if let Some(rel) = &commit.relationship {
            check_relationship(&tables, rel)?;
        }
        let selection_index = match &commit.selection {
            Some((message_id, choice_id)) => {
                let msgs = tables.messages.get(&session_id).map(Vec::as_slice).unwrap_or(&[]);
                let idx = msgs.iter().position(|m| m.id == *message_id);
                let valid = idx.and_then(|i| msgs[i].validate_selection(choice_id).ok());
                match (idx, valid) {
                    (Some(i), Some(_)) => Some((i, choice_id.clone())),
                    _ => {
                        return Err(StoreError::InvalidSelection {
                            message_id: *message_id,
                            choice_id: choice_id.clone(),
                        })
                    }
                }
            }
            None => None,
        };

        // Apply
        let sequenced = sequence_messages(&commit.messages, session_id, last_sequence);
        let log = tables.messages.entry(session_id).or_default();
        if let Some((i, choice_id)) = selection_index {
            log[i].choice_selected = Some(choice_id);
        }
        log.extend(sequenced.iter().cloned());

        let session = ConversationSession {
            version: commit.session.version + 1,
            last_sequence: last_sequence + sequenced.len() as u64,
            last_message_at: sequenced
                .last()
                .map(|m| m.created_at)
                .unwrap_or(commit.session.last_message_at),
            active: true,
            ended_at: None,
            ..commit.session.clone()
        };
        tables.sessions.insert(session_id, session.clone());

        let relationship = commit
            .relationship
            .as_ref()
            .map(|rel| write_relationship(&mut tables, rel));

        Ok(TurnReceipt {
            session,
            messages: sequenced,
            relationship,
        })
    }

    async fn get_relationship(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<RelationshipState>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .relationships
            .get(&(user_id.to_string(), persona_id.to_string()))
            .cloned())
    }

    async fn put_relationship(&self, state: &RelationshipState) -> StoreResult<RelationshipState> {
        let mut tables = self.tables.lock().await;
        check_relationship(&tables, state)?;
        Ok(write_relationship(&mut tables, state))
    }
}
