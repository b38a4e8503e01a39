//! Integration tests for the SQLite store on a real file.
//!
//! Uses tempfile::TempDir for isolated databases.

use chrono::Utc;
use heartline_core::{ConversationSession, Message, Mood, RelationshipDelta, StageTable};
use heartline_memory::{ConversationStore, RelationshipTracker, SqliteStore, TurnCommit};
use std::sync::Arc;
use std::time::Duration;

async fn open(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
    let path = dir.path().join("nested").join("heartline.db");
    Arc::new(SqliteStore::new(path, Duration::from_secs(5)).await.unwrap())
}

/// Test 1: two concurrent deltas on one relationship are both applied
#[tokio::test]
async fn test_concurrent_deltas_no_lost_update() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = open(&dir).await;
    let tracker = Arc::new(RelationshipTracker::new(store.clone(), StageTable::default(), 10));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let t = tracker.clone();
        handles.push(tokio::spawn(async move {
            t.apply_delta("u1", "luna", RelationshipDelta::affection(3)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let state = tracker.get("u1", "luna").await.unwrap();
    assert_eq!(state.affection, 18);
    assert_eq!(state.lifetime_affection, 18);
    assert_eq!(state.message_count, 6);
}

/// Test 2: state survives reopening the database
#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let session_id;
    {
        let store = open(&dir).await;
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        session_id = session.id;
        let mut updated = session.clone();
        updated.context_summary = "They talked about cats.".into();
        updated.declined_scenarios.insert(heartline_core::ScenarioType::Date);
        let updated = store.update_session(&updated).await.unwrap();
        store
            .commit_turn(&TurnCommit {
                messages: vec![
                    Message::user(session.id, "hello"),
                    Message::assistant(session.id, "hi there", Mood::Shy, None, vec![]),
                ],
                session: updated,
                relationship: None,
                selection: None,
            })
            .await
            .unwrap();
    }

    let store = open(&dir).await;
    let session = store.active_session("u1", "luna").await.unwrap().unwrap();
    assert_eq!(session.id, session_id);
    assert_eq!(session.context_summary, "They talked about cats.");
    assert_eq!(session.last_sequence, 2);
    assert!(session
        .declined_scenarios
        .contains(&heartline_core::ScenarioType::Date));
    let messages = store.recent_messages(session_id, 10).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].emotion, Some(Mood::Shy));
}

/// Test 3: concurrent session creation leaves exactly one active session
#[tokio::test]
async fn test_concurrent_create_single_active() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = open(&dir).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let s = store.clone();
        handles.push(tokio::spawn(async move {
            s.create_session(&ConversationSession::new("u1", "luna", Utc::now()))
                .await
                .is_ok()
        }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.unwrap() {
            created += 1;
        }
    }
    assert_eq!(created, 1);
    assert!(store.active_session("u1", "luna").await.unwrap().is_some());
}
