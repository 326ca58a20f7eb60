//! Session service routes

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::SessionError,
    models::{NewSession, SessionWindow},
    reconciler::{Pass, PassOutcome},
    state::AppState,
};

/// History window used when the caller gives no bounds
const DEFAULT_HISTORY_DAYS: i64 = 30;

/// Query for session history
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Create the router for the session service
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/sessions", post(create_session))
        .route("/sessions/:session_id", delete(logout))
        .route("/sessions/:session_id/valid", get(is_session_valid))
        .route("/sessions/:session_id/activity", post(record_activity))
        .route("/users/:user_id/sessions", get(get_active_sessions))
        .route("/users/:user_id/sessions/count", get(get_active_session_count))
        .route("/users/:user_id/sessions/history", get(get_session_history))
        .route("/users/:user_id/sessions/revoke", post(revoke_all_sessions))
        .route(
            "/users/:user_id/devices/:device_id/sessions",
            delete(revoke_device_sessions),
        )
        .route("/admin/reconcile/:pass", post(run_reconciliation))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.session_manager.health_check().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if health.is_healthy() { "ok" } else { "degraded" },
            "service": "session-service",
            "redis": health.redis,
            "postgres": health.postgres,
        })),
    )
}

/// Admit and store a new session
pub async fn create_session(
    State(state): State<AppState>,
    Json(payload): Json<NewSession>,
) -> Result<impl IntoResponse, SessionError> {
    info!("Creating session {} for user {}", payload.session_id, payload.user_id);
    let session = state.session_manager.create_session(payload).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

/// Log out one session
pub async fn logout(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    state.session_manager.logout(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Check whether a session is currently valid
pub async fn is_session_valid(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    let valid = state.session_manager.is_session_valid(&session_id).await?;
    Ok(Json(json!({ "session_id": session_id, "valid": valid })))
}

/// Record activity on a live session
pub async fn record_activity(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    let session = state.session_manager.record_activity(&session_id).await?;
    Ok(Json(session))
}

/// List a user's live sessions
pub async fn get_active_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let sessions = state.session_manager.get_active_sessions(user_id).await?;
    Ok(Json(sessions))
}

/// Count a user's ACTIVE sessions
pub async fn get_active_session_count(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let count = state.session_manager.get_active_session_count(user_id).await?;
    Ok(Json(json!({ "user_id": user_id, "active_sessions": count })))
}

/// Session history for a user, newest first
pub async fn get_session_history(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, SessionError> {
    let to = query.to.unwrap_or_else(|| state.session_manager.now());
    let from = query
        .from
        .unwrap_or_else(|| to - Duration::days(DEFAULT_HISTORY_DAYS));
    let window = SessionWindow::new(from, to)?;

    let history = state
        .session_manager
        .get_session_history(user_id, window)
        .await?;
    Ok(Json(history))
}

/// Revoke every session of a user
pub async fn revoke_all_sessions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, SessionError> {
    let revoked = state.session_manager.revoke_all_sessions(user_id).await?;
    Ok(Json(json!({ "revoked": revoked })))
}

/// Revoke a user's sessions on one device
pub async fn revoke_device_sessions(
    State(state): State<AppState>,
    Path((user_id, device_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, SessionError> {
    let revoked = state
        .session_manager
        .revoke_device_sessions(user_id, &device_id)
        .await?;
    Ok(Json(json!({ "revoked": revoked })))
}

/// Trigger one reconciliation pass on demand
pub async fn run_reconciliation(
    State(state): State<AppState>,
    Path(pass): Path<String>,
) -> Result<impl IntoResponse, SessionError> {
    let pass: Pass = pass.parse()?;
    info!("Manual reconciliation requested: {}", pass);

    let outcome = state.reconciler.run(pass).await;
    let status = match outcome {
        PassOutcome::Completed(_) => StatusCode::OK,
        PassOutcome::Skipped => StatusCode::CONFLICT,
        PassOutcome::Aborted(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    Ok((status, Json(outcome)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ReconcilerConfig;
    use crate::limiter::{SessionLimiter, SessionLimiterConfig};
    use crate::reconciler::Reconciler;
    use crate::session::SessionManager;
    use crate::store::{MemoryEphemeralStore, MemoryRecordStore};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        records: Arc<MemoryRecordStore>,
    }

    fn app() -> TestApp {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ephemeral = Arc::new(MemoryEphemeralStore::new(clock.clone()));
        let records = Arc::new(MemoryRecordStore::new());
        let limiter = SessionLimiter::new(
            SessionLimiterConfig {
                max_concurrent_sessions: 1,
                store_timeout: std::time::Duration::from_secs(1),
            },
            ephemeral.clone(),
            records.clone(),
        );
        let session_manager = SessionManager::new(
            ephemeral.clone(),
            records.clone(),
            limiter,
            clock.clone(),
            std::time::Duration::from_secs(1),
        );
        let reconciler = Reconciler::new(
            ephemeral,
            records.clone(),
            clock,
            ReconcilerConfig::default(),
        );

        TestApp {
            router: create_router(AppState {
                session_manager,
                reconciler,
            }),
            records,
        }
    }

    async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn new_session(id: &str, user_id: Uuid) -> Value {
        json!({
            "session_id": id,
            "user_id": user_id,
            "device": { "device_type": "WEB", "device_id": "browser-1" },
            "expires_at": Utc::now() + Duration::hours(1),
            "ip_address": "10.1.2.3",
            "user_agent": "Mozilla/5.0",
        })
    }

    #[tokio::test]
    async fn test_health_reports_both_stores() {
        let app = app();
        let (status, body) = send(&app.router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["redis"], true);
        assert_eq!(body["postgres"], true);

        app.records.set_unavailable(true).await;
        let (status, body) = send(&app.router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_http() {
        let app = app();
        let user = Uuid::new_v4();

        let (status, body) = send(
            &app.router,
            Method::POST,
            "/sessions",
            Some(new_session("s-1", user)),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["session_id"], "s-1");

        let (_, body) = send(&app.router, Method::GET, "/sessions/s-1/valid", None).await;
        assert_eq!(body["valid"], true);

        let uri = format!("/users/{}/sessions/count", user);
        let (_, body) = send(&app.router, Method::GET, &uri, None).await;
        assert_eq!(body["active_sessions"], 1);

        let (status, _) = send(&app.router, Method::DELETE, "/sessions/s-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, body) = send(&app.router, Method::GET, "/sessions/s-1/valid", None).await;
        assert_eq!(body["valid"], false);

        let uri = format!("/users/{}/sessions/history", user);
        let (status, body) = send(&app.router, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["status"], "REVOKED");
        assert_eq!(body[0]["end_reason"], "USER_LOGOUT");
    }

    #[tokio::test]
    async fn test_capacity_exceeded_names_oldest_session() {
        let app = app();
        let user = Uuid::new_v4();

        send(&app.router, Method::POST, "/sessions", Some(new_session("first", user))).await;
        let (status, body) = send(
            &app.router,
            Method::POST,
            "/sessions",
            Some(new_session("second", user)),
        )
        .await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["max_concurrent_sessions"], 1);
        assert_eq!(body["oldest_session"]["session_id"], "first");
    }

    #[tokio::test]
    async fn test_unknown_session_logout_is_not_found() {
        let app = app();
        let (status, _) = send(&app.router, Method::DELETE, "/sessions/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_manual_reconciliation() {
        let app = app();
        let (status, body) = send(&app.router, Method::POST, "/admin/reconcile/archival", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["detail"]["pass"], "archival");

        let (status, _) = send(&app.router, Method::POST, "/admin/reconcile/vacuum", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
