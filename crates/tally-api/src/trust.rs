use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;
use uuid::Uuid;

use tally_engine::Tracker;
use tally_types::api::{CanPerformQuery, HistoryQuery, UpdateScoreRequest};

use crate::state::{AppState, failure_status};

pub async fn get_trust(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.trust.fetch(false).await;
    Json(session.engine.trust.snapshot().await)
}

pub async fn update_score(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<UpdateScoreRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.reason.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let session = state.session(user_id).await;
    let trust = &session.engine.trust;
    if !trust.update_score(req.delta, &req.reason, req.metadata).await {
        let snapshot = trust.snapshot().await;
        warn!("Trust update for {} failed: {:?}", user_id, snapshot.error);
        return Err(failure_status(snapshot.error.as_ref()));
    }

    Ok(Json(trust.snapshot().await))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    Json(session.engine.trust.history(query.limit).await)
}

pub async fn can_perform(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<CanPerformQuery>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.trust.fetch(false).await;
    let allowed = session.engine.trust.can_perform_action(query.required).await;
    Json(serde_json::json!({ "required": query.required, "allowed": allowed }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.trust.refresh().await;
    Json(session.engine.trust.snapshot().await)
}
