use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use tally_engine::Tracker;

use crate::session::Session;
use crate::state::{AppState, failure_status};

async fn overview(session: &Session) -> serde_json::Value {
    let tracker = &session.engine.referral;
    serde_json::json!({
        "referrals": tracker.snapshot().await,
        "tier": tracker.tier_info().await,
        "next_tier": tracker.next_tier_info().await,
        "progress_to_next_tier": tracker.progress_to_next_tier().await,
    })
}

pub async fn get_referrals(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.referral.fetch(false).await;
    Json(overview(&session).await)
}

pub async fn load_more(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    let appended = session.engine.referral.load_more().await;
    let snapshot = session.engine.referral.snapshot().await;
    Json(serde_json::json!({ "appended": appended, "referrals": snapshot }))
}

pub async fn generate_code(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let session = state.session(user_id).await;
    let tracker = &session.engine.referral;
    if !tracker.generate_new_code().await {
        return Err(failure_status(tracker.snapshot().await.error.as_ref()));
    }
    Ok(Json(overview(&session).await))
}

pub async fn copy_code(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let session = state.session(user_id).await;
    if !session.engine.referral.copy_referral_code().await {
        // No code issued yet
        return Err(StatusCode::CONFLICT);
    }
    Ok(Json(serde_json::json!({ "copied": session.clipboard.contents() })))
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.referral.refresh().await;
    Json(overview(&session).await)
}
