use crate::in_memory::InMemoryStore;
use crate::session_manager::SessionManager;
use crate::sqlite::SqliteStore;
use crate::store::{ConversationStore, StoreError, TurnCommit};
use async_trait::async_trait;
use chrono::Utc;
use heartline_core::config::SessionConfig;
use heartline_core::{
    ChatError, Choice, ConversationSession, Message, Mood, PersonaProfile, RelationshipState, ScriptLibrary,
    StaticPersonaDirectory, Summarizer,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn sqlite() -> Arc<dyn ConversationStore> {
    Arc::new(
        SqliteStore::new(":memory:", Duration::from_secs(5))
            .await
            .expect("Failed to open in-memory SQLite"),
    )
}

fn memory() -> Arc<dyn ConversationStore> {
    Arc::new(InMemoryStore::new())
}

async fn both() -> Vec<(&'static str, Arc<dyn ConversationStore>)> {
    vec![("memory", memory()), ("sqlite", sqlite().await)]
}

fn manager(store: Arc<dyn ConversationStore>, config: SessionConfig) -> SessionManager {
    let personas = StaticPersonaDirectory::new([PersonaProfile::new("luna", "Luna", "cheerful barista")]);
    SessionManager::new(store, Arc::new(personas), Arc::new(ScriptLibrary::with_builtin()), config)
}

fn freeform_config() -> SessionConfig {
    SessionConfig {
        onboarding_script: None,
        ..SessionConfig::default()
    }
}

fn turn(session: &ConversationSession, user: &str, reply: &str) -> TurnCommit {
    TurnCommit {
        session: session.clone(),
        messages: vec![
            Message::user(session.id, user),
            Message::assistant(
                session.id,
                reply,
                Mood::Happy,
                Some("secret".into()),
                vec![Choice::free("c1", "Nice"), Choice::premium("c2", "Nicer")],
            ),
        ],
        relationship: None,
        selection: None,
    }
}

// =============================================================================
// Store conformance (both backends)
// =============================================================================

#[tokio::test]
async fn test_one_active_session_per_pair() {
    for (name, store) in both().await {
        let a = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        assert_eq!(a.version, 1, "{}", name);

        let err = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "{}: {:?}", name, err);

        // Other persona is independent
        store
            .create_session(&ConversationSession::new("u1", "mika", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.archive_active("u1", "luna").await.unwrap(), Some(a.id));
        let archived = store.get_session(a.id).await.unwrap().unwrap();
        assert!(!archived.active, "{}", name);
        assert!(archived.ended_at.is_some(), "{}", name);
        store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_commit_assigns_gap_free_sequences() {
    for (name, store) in both().await {
        let mut session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        for i in 0..3 {
            let receipt = store
                .commit_turn(&turn(&session, &format!("hi {}", i), "hello"))
                .await
                .unwrap();
            session = receipt.session;
        }
        assert_eq!(session.last_sequence, 6, "{}", name);
        assert_eq!(session.version, 4, "{}", name);

        let all = store.messages_range(session.id, 0, u64::MAX).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6], "{}", name);

        let recent = store.recent_messages(session.id, 3).await.unwrap();
        assert_eq!(
            recent.iter().map(|m| m.sequence_number).collect::<Vec<_>>(),
            vec![4, 5, 6],
            "{}",
            name
        );
        let latest = store.latest_assistant_message(session.id).await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 6, "{}", name);
        assert_eq!(latest.choices_presented.len(), 2, "{}", name);
        assert_eq!(latest.inner_thought.as_deref(), Some("secret"), "{}", name);
    }
}

#[tokio::test]
async fn test_stale_session_version_conflicts_and_writes_nothing() {
    for (name, store) in both().await {
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        store.commit_turn(&turn(&session, "first", "ok")).await.unwrap();

        // Same base version again: must lose
        let err = store.commit_turn(&turn(&session, "second", "ok")).await.unwrap_err();
        assert!(err.is_conflict(), "{}: {:?}", name, err);
        let all = store.messages_range(session.id, 0, u64::MAX).await.unwrap();
        assert_eq!(all.len(), 2, "{}", name);
    }
}

#[tokio::test]
async fn test_selection_recorded_once_and_validated() {
    for (name, store) in both().await {
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        let receipt = store.commit_turn(&turn(&session, "hey", "hi!")).await.unwrap();
        let assistant_id = receipt.messages[1].id;

        // Unknown choice id: rejected, nothing written
        let mut bad = turn(&receipt.session, "pick", "ok");
        bad.selection = Some((assistant_id, "c9".into()));
        let err = store.commit_turn(&bad).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSelection { .. }), "{}", name);
        assert_eq!(
            store.get_session(session.id).await.unwrap().unwrap().last_sequence,
            2,
            "{}",
            name
        );

        let mut good = turn(&receipt.session, "pick", "ok");
        good.selection = Some((assistant_id, "c1".into()));
        let receipt2 = store.commit_turn(&good).await.unwrap();
        let msg = store.get_message(assistant_id).await.unwrap().unwrap();
        assert_eq!(msg.choice_selected.as_deref(), Some("c1"), "{}", name);

        // Second selection on the same message
        let mut again = turn(&receipt2.session, "pick again", "ok");
        again.selection = Some((assistant_id, "c2".into()));
        assert!(store.commit_turn(&again).await.is_err(), "{}", name);
        let msg = store.get_message(assistant_id).await.unwrap().unwrap();
        assert_eq!(msg.choice_selected.as_deref(), Some("c1"), "{}", name);
    }
}

#[tokio::test]
async fn test_relationship_cas() {
    for (name, store) in both().await {
        let fresh = RelationshipState::new("u1", "luna", Utc::now());
        let stored = store.put_relationship(&fresh).await.unwrap();
        assert_eq!(stored.version, 1, "{}", name);

        // Second insert of a "new" state loses
        assert!(store.put_relationship(&fresh).await.unwrap_err().is_conflict(), "{}", name);

        let mut next = stored.clone();
        next.affection = 12;
        next.user_nickname = Some("sunshine".into());
        let stored2 = store.put_relationship(&next).await.unwrap();
        assert_eq!(stored2.version, 2, "{}", name);

        // Stale write
        assert!(store.put_relationship(&next).await.unwrap_err().is_conflict(), "{}", name);

        let loaded = store.get_relationship("u1", "luna").await.unwrap().unwrap();
        assert_eq!(loaded.affection, 12, "{}", name);
        assert_eq!(loaded.user_nickname.as_deref(), Some("sunshine"), "{}", name);
    }
}

#[tokio::test]
async fn test_turn_with_stale_relationship_rolls_back() {
    for (name, store) in both().await {
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        let rel = store
            .put_relationship(&RelationshipState::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        let mut stale = rel.clone();
        stale.version = 0;
        let mut commit = turn(&session, "hi", "hello");
        commit.relationship = Some(stale);
        assert!(store.commit_turn(&commit).await.is_err(), "{}", name);

        // Nothing from the failed turn is visible
        let s = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(s.last_sequence, 0, "{}", name);
        assert_eq!(s.version, session.version, "{}", name);
        assert!(store.messages_range(session.id, 0, u64::MAX).await.unwrap().is_empty(), "{}", name);
    }
}

#[tokio::test]
async fn test_end_session_is_idempotent() {
    for (name, store) in both().await {
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();
        assert!(store.end_session(session.id).await.unwrap(), "{}", name);
        assert!(!store.end_session(session.id).await.unwrap(), "{}", name);
        assert!(store.active_session("u1", "luna").await.unwrap().is_none(), "{}", name);
        // Ended sessions accept no more turns
        assert!(store.commit_turn(&turn(&session, "hi", "hey")).await.is_err(), "{}", name);
    }
}

// =============================================================================
// SessionManager
// =============================================================================

struct CountingSummarizer {
    calls: AtomicUsize,
}

#[async_trait]
impl Summarizer for CountingSummarizer {
    async fn summarize(&self, previous: &str, messages: &[Message]) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}[{} msgs]", previous, messages.len()))
    }
}

#[tokio::test]
async fn test_resolve_or_create_reuses_active_session() {
    let mgr = manager(memory(), freeform_config());
    let first = mgr.resolve_or_create("u1", "luna").await.unwrap();
    assert!(first.created);
    assert_eq!(first.persona.name, "Luna");
    let second = mgr.resolve_or_create("u1", "luna").await.unwrap();
    assert!(!second.created);
    assert_eq!(first.session.id, second.session.id);
}

#[tokio::test]
async fn test_unknown_persona_cannot_start_chat() {
    let mgr = manager(memory(), freeform_config());
    let err = mgr.resolve_or_create("u1", "ghost").await.unwrap_err();
    assert!(matches!(err, ChatError::SessionNotResumable(_)));
    assert_eq!(err.code(), "cannot_start_chat");
}

#[tokio::test]
async fn test_first_contact_starts_onboarding() {
    let mgr = manager(memory(), SessionConfig::default());
    let resolved = mgr.resolve_or_create("u1", "luna").await.unwrap();
    assert_eq!(resolved.session.current_episode.as_deref(), Some("onboarding"));
    assert_eq!(resolved.session.current_scene, "intro");
}

#[tokio::test]
async fn test_returning_user_skips_onboarding() {
    let store = memory();
    store
        .put_relationship(&RelationshipState::new("u1", "luna", Utc::now()))
        .await
        .unwrap();
    let mgr = manager(store, SessionConfig::default());
    let resolved = mgr.resolve_or_create("u1", "luna").await.unwrap();
    assert!(resolved.session.is_freeform());
}

#[tokio::test]
async fn test_start_session_archives_previous() {
    let mgr = manager(memory(), freeform_config());
    let a = mgr.resolve_or_create("u1", "luna").await.unwrap().session;
    let b = mgr.start_session("u1", "luna").await.unwrap().session;
    assert_ne!(a.id, b.id);
    let old = mgr.store().get_session(a.id).await.unwrap().unwrap();
    assert!(!old.active);

    // A stale client id resolves to the new active session
    let resolved = mgr.resolve("u1", "luna", Some(a.id)).await.unwrap();
    assert_eq!(resolved.session.id, b.id);
}

#[tokio::test]
async fn test_foreign_session_is_not_found() {
    let mgr = manager(memory(), freeform_config());
    let s = mgr.resolve_or_create("u1", "luna").await.unwrap().session;
    assert!(matches!(
        mgr.resolve("intruder", "luna", Some(s.id)).await,
        Err(ChatError::InvalidRequest(_))
    ));
    assert!(mgr.history(s.id, "intruder").await.is_err());
    assert!(mgr.end_session(s.id, "intruder").await.is_err());
}

#[tokio::test]
async fn test_history_redacts_inner_thoughts() {
    let mgr = manager(memory(), freeform_config());
    let s = mgr.resolve_or_create("u1", "luna").await.unwrap().session;
    mgr.append_turn(&turn(&s, "hi", "hello")).await.unwrap();

    let history = mgr.history(s.id, "u1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|m| m.inner_thought.is_none()));

    let admin = mgr.history_for_admin(s.id).await.unwrap();
    assert_eq!(admin[1].inner_thought.as_deref(), Some("secret"));
}

#[tokio::test]
async fn test_summary_triggers_on_interval() {
    let config = SessionConfig {
        summary_interval: 6,
        keep_recent: 2,
        onboarding_script: None,
        ..SessionConfig::default()
    };
    let mgr = manager(memory(), config);
    let summarizer = CountingSummarizer {
        calls: AtomicUsize::new(0),
    };
    let mut s = mgr.resolve_or_create("u1", "luna").await.unwrap().session;

    for i in 0..2 {
        s = mgr.append_turn(&turn(&s, &format!("m{}", i), "r")).await.unwrap().session;
        assert!(mgr.maybe_summarize(&s, &summarizer).await.is_none());
    }
    s = mgr.append_turn(&turn(&s, "m2", "r")).await.unwrap().session;
    let summarized = mgr.maybe_summarize(&s, &summarizer).await.unwrap();
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(summarized.summarized_through, 4);
    assert_eq!(summarized.context_summary, "[4 msgs]");
    assert_eq!(summarized.last_sequence, 6);
}

#[tokio::test]
async fn test_summary_triggers_on_char_budget() {
    let config = SessionConfig {
        summary_interval: 1_000,
        summary_char_budget: 50,
        keep_recent: 0,
        onboarding_script: None,
        ..SessionConfig::default()
    };
    let mgr = manager(memory(), config);
    let summarizer = CountingSummarizer {
        calls: AtomicUsize::new(0),
    };
    let s = mgr.resolve_or_create("u1", "luna").await.unwrap().session;
    let long = "x".repeat(80);
    let s = mgr.append_turn(&turn(&s, &long, "r")).await.unwrap().session;
    assert!(mgr.maybe_summarize(&s, &summarizer).await.is_some());
}

#[tokio::test]
async fn test_end_session_idempotent_via_manager() {
    let mgr = manager(memory(), freeform_config());
    let s = mgr.resolve_or_create("u1", "luna").await.unwrap().session;
    assert!(mgr.end_session(s.id, "u1").await.unwrap());
    assert!(!mgr.end_session(s.id, "u1").await.unwrap());
    let next = mgr.resolve_or_create("u1", "luna").await.unwrap();
    assert!(next.created);
}
