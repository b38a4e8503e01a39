use crate::error::AppError;
use crate::types::{
    ChatResponse, EndSessionResponse, HistoryResponse, ScenarioBody, ScenarioReply, StartSessionBody,
};
use anyhow::Context;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post, put},
    Json, Router,
};
use heartline_core::{ChatError, ConversationSession, RelationshipState};
use heartline_memory::NicknameUpdate;
use heartline_reasoning::{ChatEngine, TurnRequest};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

/// Header carrying the caller's user id. Authentication happens upstream.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
struct AppState {
    engine: Arc<ChatEngine>,
}

/// HTTP surface for the chat engine.
///
/// - `POST /api/ai/chat` runs one chat turn
/// - `/api/sessions/...` manages sessions and scenario hand-offs
/// - `/api/relationships/...` reads relationship state and sets nicknames
/// - `GET /health` health check
pub struct GatewayServer {
    engine: Arc<ChatEngine>,
    host: String,
    port: u16,
}

impl GatewayServer {
    pub fn new(engine: Arc<ChatEngine>, host: &str, port: u16) -> Self {
        Self {
            engine,
            host: host.to_string(),
            port,
        }
    }

    /// Bind and serve until the process exits.
    pub async fn serve(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Gateway failed to bind {}", addr))?;
        tracing::info!("Gateway listening on {}", addr);
        axum::serve(listener, router(self.engine))
            .await
            .context("Gateway server error")
    }

    /// Serve on a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                tracing::error!("{:#}", e);
            }
        })
    }
}

pub fn router(engine: Arc<ChatEngine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/ai/chat", post(chat))
        .route("/api/sessions", post(start_session))
        .route("/api/sessions/:id/end", post(end_session))
        .route("/api/sessions/:id/scenario", post(respond_to_scenario))
        .route("/api/sessions/:id/messages", get(history))
        .route("/api/relationships/:persona_id", get(relationship))
        .route("/api/relationships/:persona_id/nicknames", put(set_nicknames))
        .layer(CorsLayer::permissive())
        .with_state(AppState { engine })
}

fn user_id(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(AppError::Unauthenticated)
}

// ============================================================================
// Route handlers
// ============================================================================

async fn health() -> &'static str {
    "ok"
}

/// POST /api/ai/chat
///
/// The turn runs on its own task: a client that hangs up does not cancel
/// generation or the commit.
async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TurnRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let user = user_id(&headers)?;
    let engine = state.engine.clone();
    let turn = tokio::spawn(async move { engine.chat_turn(&user, req).await });
    let outcome = turn
        .await
        .map_err(|e| ChatError::Internal(anyhow::anyhow!("chat turn task failed: {}", e)))??;
    Ok(Json(ChatResponse::from(outcome)))
}

async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartSessionBody>,
) -> Result<Json<ConversationSession>, AppError> {
    let user = user_id(&headers)?;
    Ok(Json(state.engine.start_session(&user, &body.persona_id).await?))
}

async fn end_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<EndSessionResponse>, AppError> {
    let user = user_id(&headers)?;
    let ended = state.engine.end_session(&user, id).await?;
    Ok(Json(EndSessionResponse { ended }))
}

async fn respond_to_scenario(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(body): Json<ScenarioBody>,
) -> Result<Json<ScenarioReply>, AppError> {
    let user = user_id(&headers)?;
    let resp = state
        .engine
        .respond_to_scenario(&user, id, body.scenario_type, body.accepted)
        .await?;
    Ok(Json(ScenarioReply::from(resp)))
}

async fn history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = user_id(&headers)?;
    let messages = state.engine.history(&user, id).await?;
    Ok(Json(HistoryResponse {
        session_id: id,
        messages,
    }))
}

async fn relationship(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(persona_id): Path<String>,
) -> Result<Json<RelationshipState>, AppError> {
    let user = user_id(&headers)?;
    Ok(Json(state.engine.relationship(&user, &persona_id).await?))
}

async fn set_nicknames(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(persona_id): Path<String>,
    Json(update): Json<NicknameUpdate>,
) -> Result<Json<RelationshipState>, AppError> {
    let user = user_id(&headers)?;
    Ok(Json(state.engine.set_nicknames(&user, &persona_id, update).await?))
}
