use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use crate::state::AppState;

/// Pending toasts, oldest first. Reading clears the queue.
pub async fn drain(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    Json(session.notifier.drain())
}

pub async fn end_session(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> StatusCode {
    if state.end_session(user_id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
