use crate::error::SessionError;
use crate::media::{OfferRequest, SessionDescription};
use crate::pipeline::orchestrator::SessionManager;
use crate::session::SessionInfo;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

pub async fn health_handler() -> &'static str {
    "vision-relay is running"
}

/// Map session errors onto HTTP status codes
fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::Duplicate(_) => StatusCode::CONFLICT,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Closed(_) => StatusCode::GONE,
        SessionError::Negotiation(_) => StatusCode::BAD_GATEWAY,
        SessionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub async fn offer_handler(
    State(manager): State<Arc<SessionManager>>,
    Json(request): Json<OfferRequest>,
) -> Result<Json<SessionDescription>, (StatusCode, String)> {
    if request.client_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing clientId".to_string()));
    }

    manager
        .open_session(&request.client_id, request.offer)
        .await
        .map(Json)
        .map_err(|e| (status_for(&e), e.to_string()))
}

pub async fn list_sessions_handler(
    State(manager): State<Arc<SessionManager>>,
) -> Json<Vec<SessionInfo>> {
    Json(manager.sessions())
}

pub async fn close_session_handler(
    State(manager): State<Arc<SessionManager>>,
    Path(client_id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    manager
        .close_session(&client_id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(|e| (status_for(&e), e.to_string()))
}
