//! Error types for the session lifecycle service

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::SessionMetadata;

/// Errors raised by the session stores, the limiter and the manager
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session or metadata absent on a direct lookup
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Duplicate session id on create
    #[error("Session already exists: {0}")]
    Conflict(String),

    /// Limiter rejection; `oldest` is the eviction candidate left to the caller
    #[error("User {user_id} already has {active} of {max} concurrent sessions")]
    CapacityExceeded {
        user_id: Uuid,
        active: u64,
        max: u32,
        oldest: Option<Box<SessionMetadata>>,
    },

    /// Transient I/O failure or timeout from either store
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    /// Stored data could not be encoded or decoded
    #[error("Session data could not be decoded: {0}")]
    Serialization(String),

    /// Rejected before reaching a store
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl SessionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SessionError::NotFound(_))
    }
}

impl From<redis::RedisError> for SessionError {
    fn from(err: redis::RedisError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SessionError::Conflict(db.message().to_string())
            }
            sqlx::Error::RowNotFound => SessionError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                SessionError::Serialization(err.to_string())
            }
            _ => SessionError::StoreUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SessionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SessionError::StoreUnavailable("store call timed out".to_string())
    }
}

impl From<common::error::DatabaseError> for SessionError {
    fn from(err: common::error::DatabaseError) -> Self {
        SessionError::StoreUnavailable(err.to_string())
    }
}

/// The Redis client surfaces `anyhow` errors
impl From<anyhow::Error> for SessionError {
    fn from(err: anyhow::Error) -> Self {
        SessionError::StoreUnavailable(format!("{:#}", err))
    }
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::NotFound(_) => StatusCode::NOT_FOUND,
            SessionError::Conflict(_) => StatusCode::CONFLICT,
            SessionError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            SessionError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        };

        let body = match &self {
            SessionError::CapacityExceeded {
                active,
                max,
                oldest,
                ..
            } => json!({
                "error": self.to_string(),
                "active_sessions": active,
                "max_concurrent_sessions": max,
                "oldest_session": oldest.as_deref().map(|m| json!({
                    "session_id": m.session_id,
                    "started_at": m.started_at,
                    "last_activity_at": m.last_activity_at,
                    "device": m.device,
                })),
            }),
            // Store internals stay out of responses
            SessionError::StoreUnavailable(_) => json!({ "error": "Session store unavailable" }),
            SessionError::Serialization(_) => json!({ "error": "Internal server error" }),
            _ => json!({ "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Type alias for session results
pub type SessionResult<T> = Result<T, SessionError>;
