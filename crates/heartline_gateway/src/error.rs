//! Maps turn errors onto structured JSON responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use heartline_core::error::codes;
use heartline_core::ChatError;
use serde::Serialize;

pub const UNAUTHENTICATED: &str = "unauthenticated";

/// Wire body of every error response.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
}

#[derive(Debug)]
pub enum AppError {
    /// No usable `x-user-id` header (401)
    Unauthenticated,
    Chat(ChatError),
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        AppError::Chat(err)
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Chat(err) => match err {
                ChatError::SessionNotResumable(_) => StatusCode::UNPROCESSABLE_ENTITY,
                ChatError::ConcurrentUpdateConflict { .. } => StatusCode::CONFLICT,
                ChatError::InvalidChoiceSelection { .. } => StatusCode::BAD_REQUEST,
                ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn body(&self) -> ApiError {
        match self {
            AppError::Unauthenticated => ApiError {
                error: UNAUTHENTICATED.to_string(),
                message: "missing x-user-id header".to_string(),
            },
            AppError::Chat(err) => ApiError {
                error: err.code().to_string(),
                message: err.public_message(),
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Chat(ChatError::Internal(e)) => tracing::error!("Internal error: {:#}", e),
            AppError::Chat(ChatError::SessionNotResumable(detail)) => {
                tracing::info!("Cannot start chat: {}", detail)
            }
            AppError::Chat(err) if err.code() == codes::CONFLICT => tracing::warn!("{}", err),
            _ => {}
        }
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_details_not_exposed() {
        let err = AppError::from(ChatError::Internal(anyhow::anyhow!("sqlite: database is locked")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.body();
        assert_eq!(body.error, "internal_error");
        assert!(!body.message.contains("sqlite"));
    }

    #[test]
    fn test_status_per_code() {
        let cases = [
            (ChatError::SessionNotResumable("unknown persona".into()), 422, "cannot_start_chat"),
            (
                ChatError::ConcurrentUpdateConflict {
                    resource: "session".into(),
                    attempts: 3,
                },
                409,
                "conflict",
            ),
            (
                ChatError::InvalidChoiceSelection {
                    choice_id: "c7".into(),
                    message_id: None,
                },
                400,
                "invalid_choice",
            ),
            (ChatError::InvalidRequest("bad".into()), 400, "invalid_request"),
        ];
        for (err, status, code) in cases {
            let err = AppError::from(err);
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.body().error, code);
        }
    }

    #[test]
    fn test_cannot_start_chat_message_is_generic() {
        let err = AppError::from(ChatError::SessionNotResumable("persona x row corrupted".into()));
        assert_eq!(err.body().message, "Cannot start chat right now.");
    }
}
