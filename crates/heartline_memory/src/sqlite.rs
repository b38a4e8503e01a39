use crate::store::{sequence_messages, ConversationStore, StoreError, StoreResult, TurnCommit, TurnReceipt};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use heartline_core::{
    Choice, ConversationSession, EmotionalState, Message, Mood, RelationshipStage, RelationshipState, Role,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, user_id, persona_id, current_scene, current_episode, mood, intensity, \
     context_summary, summarized_through, last_sequence, offered_json, declined_json, active, \
     started_at, last_message_at, ended_at, version";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, emotion, inner_thought, choices_json, \
     choice_selected, created_at, sequence_number";

const RELATIONSHIP_COLUMNS: &str = "user_id, persona_id, affection, trust, intimacy, lifetime_affection, \
     stage, message_count, first_interaction_at, last_interaction_at, persona_nickname, user_nickname, \
     declined_json, version";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    /// Upper bound for a whole write, on top of the lock and pool timeouts.
    timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `db_path`. `":memory:"`
    /// gives a private single-connection database.
    pub async fn new<P: AsRef<Path>>(db_path: P, timeout: Duration) -> Result<Self> {
        let path = db_path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
            }
            format!("sqlite://{}", path.display())
        };

        let options = SqliteConnectOptions::from_str(&url)
            .context("Invalid SQLite path")?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .acquire_timeout(timeout)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool, timeout };
        store.migrate().await?;
        tracing::info!("SQLite store ready at {}", path.display());
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                current_scene TEXT NOT NULL,
                current_episode TEXT,
                mood TEXT NOT NULL,
                intensity INTEGER NOT NULL,
                context_summary TEXT NOT NULL DEFAULT '',
                summarized_through INTEGER NOT NULL DEFAULT 0,
                last_sequence INTEGER NOT NULL DEFAULT 0,
                offered_json TEXT NOT NULL DEFAULT '[]',
                declined_json TEXT NOT NULL DEFAULT '[]',
                active INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                last_message_at INTEGER NOT NULL,
                ended_at INTEGER,
                version INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        // At most one active session per (user, persona)
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_active ON sessions(user_id, persona_id) WHERE active = 1",
        )
        .execute(&self.pool)
        .await
        .context("Failed to create active session index")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                emotion TEXT,
                inner_thought TEXT,
                choices_json TEXT NOT NULL DEFAULT '[]',
                choice_selected TEXT,
                created_at INTEGER NOT NULL,
                sequence_number INTEGER NOT NULL,
                UNIQUE(session_id, sequence_number)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS relationships (
                user_id TEXT NOT NULL,
                persona_id TEXT NOT NULL,
                affection INTEGER NOT NULL,
                trust INTEGER NOT NULL,
                intimacy INTEGER NOT NULL,
                lifetime_affection INTEGER NOT NULL,
                stage TEXT NOT NULL,
                message_count INTEGER NOT NULL,
                first_interaction_at INTEGER NOT NULL,
                last_interaction_at INTEGER NOT NULL,
                persona_nickname TEXT,
                user_nickname TEXT,
                declined_json TEXT NOT NULL DEFAULT '[]',
                version INTEGER NOT NULL,
                PRIMARY KEY (user_id, persona_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create relationships table")?;

        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).with_context(|| format!("Invalid timestamp {}", ms))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid uuid {}", raw))
}

fn parse_stage(raw: &str) -> Result<RelationshipStage> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .with_context(|| format!("Unknown relationship stage {}", raw))
}

fn session_from_row(row: &SqliteRow) -> Result<ConversationSession> {
    let mood: String = row.try_get("mood")?;
    let intensity: i64 = row.try_get("intensity")?;
    let offered: String = row.try_get("offered_json")?;
    let declined: String = row.try_get("declined_json")?;
    let ended_at: Option<i64> = row.try_get("ended_at")?;
    Ok(ConversationSession {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        user_id: row.try_get("user_id")?,
        persona_id: row.try_get("persona_id")?,
        current_scene: row.try_get("current_scene")?,
        current_episode: row.try_get("current_episode")?,
        emotional_state: EmotionalState::new(Mood::parse_or_neutral(&mood), intensity as i32),
        context_summary: row.try_get("context_summary")?,
        summarized_through: row.try_get::<i64, _>("summarized_through")? as u64,
        last_sequence: row.try_get::<i64, _>("last_sequence")? as u64,
        offered_scenarios: serde_json::from_str(&offered).context("Corrupt offered_json")?,
        declined_scenarios: serde_json::from_str(&declined).context("Corrupt declined_json")?,
        active: row.try_get::<i64, _>("active")? != 0,
        started_at: from_millis(row.try_get("started_at")?)?,
        last_message_at: from_millis(row.try_get("last_message_at")?)?,
        ended_at: ended_at.map(from_millis).transpose()?,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let emotion: Option<String> = row.try_get("emotion")?;
    let choices: String = row.try_get("choices_json")?;
    Ok(Message {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        session_id: parse_uuid(&row.try_get::<String, _>("session_id")?)?,
        role: Role::parse(&role).with_context(|| format!("Unknown role {}", role))?,
        content: row.try_get("content")?,
        emotion: emotion.map(|e| Mood::parse_or_neutral(&e)),
        inner_thought: row.try_get("inner_thought")?,
        choices_presented: serde_json::from_str::<Vec<Choice>>(&choices).context("Corrupt choices_json")?,
        choice_selected: row.try_get("choice_selected")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        sequence_number: row.try_get::<i64, _>("sequence_number")? as u64,
    })
}

fn relationship_from_row(row: &SqliteRow) -> Result<RelationshipState> {
    let stage: String = row.try_get("stage")?;
    let declined: String = row.try_get("declined_json")?;
    Ok(RelationshipState {
        user_id: row.try_get("user_id")?,
        persona_id: row.try_get("persona_id")?,
        affection: row.try_get::<i64, _>("affection")?.clamp(0, 100) as u8,
        trust: row.try_get::<i64, _>("trust")?.clamp(0, 100) as u8,
        intimacy: row.try_get::<i64, _>("intimacy")?.clamp(0, 100) as u8,
        lifetime_affection: row.try_get::<i64, _>("lifetime_affection")? as u64,
        stage: parse_stage(&stage)?,
        message_count: row.try_get::<i64, _>("message_count")? as u64,
        first_interaction_at: from_millis(row.try_get("first_interaction_at")?)?,
        last_interaction_at: from_millis(row.try_get("last_interaction_at")?)?,
        persona_nickname: row.try_get("persona_nickname")?,
        user_nickname: row.try_get("user_nickname")?,
        declined_scenarios: serde_json::from_str::<BTreeSet<_>>(&declined).context("Corrupt declined_json")?,
        version: row.try_get::<i64, _>("version")? as u64,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

fn backend(e: sqlx::Error, what: &str) -> StoreError {
    tracing::error!("SQLite {} failed: {}", what, e);
    StoreError::Backend(anyhow::Error::new(e).context(format!("SQLite {} failed", what)))
}

/// Bound a store operation; a timed-out transaction is dropped and rolls back.
async fn with_deadline<T>(
    limit: Duration,
    what: &str,
    op: impl std::future::Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!("SQLite {} timed out after {:?}", what, limit);
            Err(StoreError::Backend(anyhow::anyhow!("SQLite {} timed out after {:?}", what, limit)))
        }
    }
}

fn json(value: &impl serde::Serialize) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|e| StoreError::Backend(e.into()))
}

// =============================================================================
// Store
// =============================================================================

impl SqliteStore {
    async fn put_relationship_now(&self, state: &RelationshipState) -> StoreResult<RelationshipState> {
        let mut conn = self.pool.acquire().await.map_err(|e| backend(e, "acquire"))?;
        self.write_relationship(&mut conn, state).await
    }

    async fn commit_in_tx(&self, commit: &TurnCommit) -> StoreResult<TurnReceipt> {
        let session = &commit.session;
        let sequenced = sequence_messages(&commit.messages, session.id, session.last_sequence);
        let last_sequence = session.last_sequence + sequenced.len() as u64;
        let last_message_at = sequenced.last().map(|m| m.created_at).unwrap_or(session.last_message_at);

        let mut tx = self.pool.begin().await.map_err(|e| backend(e, "begin"))?;

        // Write first so the transaction takes the write lock before any read.
        // The version guard also pins `session.last_sequence` to the stored value.
        self.write_session(&mut tx, session, last_sequence, last_message_at).await?;

        let relationship = match &commit.relationship {
            Some(rel) => Some(self.write_relationship(&mut tx, rel).await?),
            None => None,
        };

        if let Some((message_id, choice_id)) = &commit.selection {
            let invalid = || StoreError::InvalidSelection {
                message_id: *message_id,
                choice_id: choice_id.clone(),
            };
            let row = sqlx::query(&format!(
                "SELECT {} FROM messages WHERE id = ? AND session_id = ?",
                MESSAGE_COLUMNS
            ))
            .bind(message_id.to_string())
            .bind(session.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| backend(e, "selection lookup"))?;
            let message = row.as_ref().map(message_from_row).transpose()?.ok_or_else(invalid)?;
            message.validate_selection(choice_id).map_err(|_| invalid())?;
            sqlx::query("UPDATE messages SET choice_selected = ? WHERE id = ? AND choice_selected IS NULL")
                .bind(choice_id)
                .bind(message_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| backend(e, "selection update"))?;
        }

        for m in &sequenced {
            sqlx::query(&format!(
                "INSERT INTO messages ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                MESSAGE_COLUMNS
            ))
            .bind(m.id.to_string())
            .bind(m.session_id.to_string())
            .bind(m.role.as_str())
            .bind(&m.content)
            .bind(m.emotion.map(|e| e.as_str()))
            .bind(&m.inner_thought)
            .bind(json(&m.choices_presented)?)
            .bind(&m.choice_selected)
            .bind(millis(m.created_at))
            .bind(m.sequence_number as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| backend(e, "message insert"))?;
        }

        tx.commit().await.map_err(|e| backend(e, "commit"))?;
        tracing::debug!(
            "Committed {} message(s) to session {} (seq {})",
            sequenced.len(),
            session.id,
            last_sequence
        );

        Ok(TurnReceipt {
            session: ConversationSession {
                version: session.version + 1,
                last_sequence,
                last_message_at,
                ..session.clone()
            },
            messages: sequenced,
            relationship,
        })
    }

    async fn write_session(
        &self,
        conn: &mut sqlx::SqliteConnection,
        session: &ConversationSession,
        last_sequence: u64,
        last_message_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET current_scene = ?, current_episode = ?, mood = ?, intensity = ?, \
             context_summary = ?, summarized_through = ?, last_sequence = ?, offered_json = ?, \
             declined_json = ?, last_message_at = ?, version = version + 1 \
             WHERE id = ? AND version = ? AND active = 1",
        )
        .bind(&session.current_scene)
        .bind(&session.current_episode)
        .bind(session.emotional_state.mood.as_str())
        .bind(session.emotional_state.intensity as i64)
        .bind(&session.context_summary)
        .bind(session.summarized_through as i64)
        .bind(last_sequence as i64)
        .bind(json(&session.offered_scenarios)?)
        .bind(json(&session.declined_scenarios)?)
        .bind(millis(last_message_at))
        .bind(session.id.to_string())
        .bind(session.version as i64)
        .execute(&mut *conn)
        .await
        .map_err(|e| backend(e, "session update"))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { resource: "session" });
        }
        Ok(())
    }

    async fn write_relationship(
        &self,
        conn: &mut sqlx::SqliteConnection,
        state: &RelationshipState,
    ) -> StoreResult<RelationshipState> {
        let declined = json(&state.declined_scenarios)?;
        let result = if state.version == 0 {
            sqlx::query(&format!(
                "INSERT INTO relationships ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1)",
                RELATIONSHIP_COLUMNS
            ))
            .bind(&state.user_id)
            .bind(&state.persona_id)
            .bind(state.affection as i64)
            .bind(state.trust as i64)
            .bind(state.intimacy as i64)
            .bind(state.lifetime_affection as i64)
            .bind(state.stage.as_str())
            .bind(state.message_count as i64)
            .bind(millis(state.first_interaction_at))
            .bind(millis(state.last_interaction_at))
            .bind(&state.persona_nickname)
            .bind(&state.user_nickname)
            .bind(&declined)
            .execute(&mut *conn)
            .await
        } else {
            sqlx::query(
                "UPDATE relationships SET affection = ?, trust = ?, intimacy = ?, lifetime_affection = ?, \
                 stage = ?, message_count = ?, last_interaction_at = ?, persona_nickname = ?, \
                 user_nickname = ?, declined_json = ?, version = version + 1 \
                 WHERE user_id = ? AND persona_id = ? AND version = ?",
            )
            .bind(state.affection as i64)
            .bind(state.trust as i64)
            .bind(state.intimacy as i64)
            .bind(state.lifetime_affection as i64)
            .bind(state.stage.as_str())
            .bind(state.message_count as i64)
            .bind(millis(state.last_interaction_at))
            .bind(&state.persona_nickname)
            .bind(&state.user_nickname)
            .bind(&declined)
            .bind(&state.user_id)
            .bind(&state.persona_id)
            .bind(state.version as i64)
            .execute(&mut *conn)
            .await
        };
        match result {
            Ok(r) if r.rows_affected() == 1 => Ok(RelationshipState {
                version: state.version + 1,
                ..state.clone()
            }),
            Ok(_) => Err(StoreError::Conflict {
                resource: "relationship",
            }),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict {
                resource: "relationship",
            }),
            Err(e) => Err(backend(e, "relationship write")),
        }
    }

    async fn fetch_messages(&self, sql: &str, session_id: Uuid, a: i64, b: i64) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(sql)
            .bind(session_id.to_string())
            .bind(a)
            .bind(b)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| backend(e, "message query"))?;
        rows.iter()
            .map(|r| message_from_row(r).map_err(StoreError::Backend))
            .collect()
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn active_session(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<ConversationSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE user_id = ? AND persona_id = ? AND active = 1",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .bind(persona_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(e, "session lookup"))?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn get_session(&self, session_id: Uuid) -> StoreResult<Option<ConversationSession>> {
        let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS))
            .bind(session_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "session lookup"))?;
        Ok(row.as_ref().map(session_from_row).transpose()?)
    }

    async fn create_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession> {
        let result = sqlx::query(&format!(
            "INSERT INTO sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, NULL, 1)",
            SESSION_COLUMNS
        ))
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(&session.persona_id)
        .bind(&session.current_scene)
        .bind(&session.current_episode)
        .bind(session.emotional_state.mood.as_str())
        .bind(session.emotional_state.intensity as i64)
        .bind(&session.context_summary)
        .bind(session.summarized_through as i64)
        .bind(session.last_sequence as i64)
        .bind(json(&session.offered_scenarios)?)
        .bind(json(&session.declined_scenarios)?)
        .bind(millis(session.started_at))
        .bind(millis(session.last_message_at))
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(ConversationSession {
                version: 1,
                active: true,
                ended_at: None,
                ..session.clone()
            }),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict { resource: "session" }),
            Err(e) => Err(backend(e, "session insert")),
        }
    }

    async fn archive_active(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<Uuid>> {
        let row = sqlx::query(
            "UPDATE sessions SET active = 0, ended_at = ?, version = version + 1 \
             WHERE user_id = ? AND persona_id = ? AND active = 1 RETURNING id",
        )
        .bind(millis(Utc::now()))
        .bind(user_id)
        .bind(persona_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(e, "session archive"))?;
        match row {
            Some(row) => {
                let id: String = row.try_get("id").map_err(|e| backend(e, "session archive"))?;
                Ok(Some(parse_uuid(&id)?))
            }
            None => Ok(None),
        }
    }

    async fn update_session(&self, session: &ConversationSession) -> StoreResult<ConversationSession> {
        let current = self
            .get_session(session.id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        let mut conn = self.pool.acquire().await.map_err(|e| backend(e, "acquire"))?;
        self.write_session(&mut conn, session, current.last_sequence, session.last_message_at)
            .await?;
        Ok(ConversationSession {
            version: session.version + 1,
            last_sequence: current.last_sequence,
            active: current.active,
            ended_at: current.ended_at,
            ..session.clone()
        })
    }

    async fn end_session(&self, session_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET active = 0, ended_at = ?, version = version + 1 WHERE id = ? AND active = 1",
        )
        .bind(millis(Utc::now()))
        .bind(session_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| backend(e, "session end"))?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_session(session_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(format!("session {}", session_id))),
        }
    }

    async fn get_message(&self, message_id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS))
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| backend(e, "message lookup"))?;
        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    async fn recent_messages(&self, session_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT * FROM (SELECT {} FROM messages WHERE session_id = ? AND sequence_number > ? \
             ORDER BY sequence_number DESC LIMIT ?) ORDER BY sequence_number ASC",
            MESSAGE_COLUMNS
        );
        self.fetch_messages(&sql, session_id, 0, limit as i64).await
    }

    async fn messages_range(&self, session_id: Uuid, after: u64, through: u64) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM messages WHERE session_id = ? AND sequence_number > ? AND sequence_number <= ? \
             ORDER BY sequence_number ASC",
            MESSAGE_COLUMNS
        );
        let through = i64::try_from(through).unwrap_or(i64::MAX);
        self.fetch_messages(&sql, session_id, after as i64, through).await
    }

    async fn latest_assistant_message(&self, session_id: Uuid) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages WHERE session_id = ? AND role = 'assistant' \
             ORDER BY sequence_number DESC LIMIT 1",
            MESSAGE_COLUMNS
        ))
        .bind(session_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(e, "message lookup"))?;
        Ok(row.as_ref().map(message_from_row).transpose()?)
    }

    async fn commit_turn(&self, commit: &TurnCommit) -> StoreResult<TurnReceipt> {
        with_deadline(self.timeout, "turn commit", self.commit_in_tx(commit)).await
    }

    async fn get_relationship(&self, user_id: &str, persona_id: &str) -> StoreResult<Option<RelationshipState>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM relationships WHERE user_id = ? AND persona_id = ?",
            RELATIONSHIP_COLUMNS
        ))
        .bind(user_id)
        .bind(persona_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| backend(e, "relationship lookup"))?;
        Ok(row.as_ref().map(relationship_from_row).transpose()?)
    }

    async fn put_relationship(&self, state: &RelationshipState) -> StoreResult<RelationshipState> {
        with_deadline(self.timeout, "relationship write", self.put_relationship_now(state)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_turns_a_hang_into_a_backend_error() {
        let pending = std::future::pending::<StoreResult<()>>();
        let err = with_deadline(Duration::from_millis(20), "turn commit", pending)
            .await
            .unwrap_err();
        assert!(!err.is_conflict());
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_commit_gives_up_while_database_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("locked.db");
        let store = SqliteStore::new(&path, Duration::from_millis(200)).await.unwrap();
        let session = store
            .create_session(&ConversationSession::new("u1", "luna", Utc::now()))
            .await
            .unwrap();

        // A second writer holds the write lock
        let other = SqliteStore::new(&path, Duration::from_millis(200)).await.unwrap();
        let mut blocker = other.pool.begin().await.unwrap();
        sqlx::query("UPDATE sessions SET context_summary = 'x'")
            .execute(&mut *blocker)
            .await
            .unwrap();

        let commit = TurnCommit {
            session: session.clone(),
            messages: vec![
                Message::user(session.id, "hello?"),
                Message::assistant(session.id, "hi", Mood::Happy, None, vec![]),
            ],
            relationship: None,
            selection: None,
        };
        let started = std::time::Instant::now();
        let err = store.commit_turn(&commit).await.unwrap_err();
        assert!(!err.is_conflict());
        assert!(started.elapsed() < Duration::from_secs(5));

        blocker.rollback().await.unwrap();
        let stored = store.get_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.last_sequence, 0);
        assert_eq!(stored.version, session.version);
    }
}
