use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;
use uuid::Uuid;

use tally_engine::challenge::{filter_by_status, filter_by_type};
use tally_engine::Tracker;
use tally_types::api::{ChallengeQuery, UpdateProgressRequest};
use tally_types::models::ChallengeWithProgress;
use tally_types::tables;

use crate::session::Session;
use crate::state::{AppState, failure_status};

async fn listing(session: &Session, query: &ChallengeQuery) -> serde_json::Value {
    let tracker = &session.engine.challenge;
    let snapshot = tracker.snapshot().await;

    let mut challenges = snapshot.data.unwrap_or_default();
    if let Some(status) = query.status {
        challenges = filter_by_status(&challenges, status);
    }
    if let Some(challenge_type) = query.challenge_type {
        challenges = filter_by_type(&challenges, challenge_type);
    }

    serde_json::json!({
        "challenges": challenges,
        "unclaimed": tracker.unclaimed_challenges().await.len(),
        "total_rewards_available": tracker.total_rewards_available().await,
        "is_loading": snapshot.is_loading,
        "is_updating": snapshot.is_updating,
        "error": snapshot.error,
    })
}

async fn entry(session: &Session, challenge_id: &str) -> Option<ChallengeWithProgress> {
    session
        .engine
        .challenge
        .challenges()
        .await
        .into_iter()
        .find(|c| c.challenge.id == challenge_id)
}

pub async fn list_challenges(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<ChallengeQuery>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.challenge.fetch().await;
    Json(listing(&session, &query).await)
}

pub async fn update_progress(
    State(state): State<AppState>,
    Path((user_id, challenge_id)): Path<(Uuid, String)>,
    Json(req): Json<UpdateProgressRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if tables::challenge(&challenge_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    if req.progress < 0 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let session = state.session(user_id).await;
    let tracker = &session.engine.challenge;
    if !tracker.update_progress(&challenge_id, req.progress).await {
        let snapshot = tracker.snapshot().await;
        warn!("Progress update on {} for {} failed: {:?}", challenge_id, user_id, snapshot.error);
        return Err(failure_status(snapshot.error.as_ref()));
    }

    entry(&session, &challenge_id)
        .await
        .map(Json)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn claim_reward(
    State(state): State<AppState>,
    Path((user_id, challenge_id)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, StatusCode> {
    if tables::challenge(&challenge_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    let session = state.session(user_id).await;
    match session.engine.challenge.try_claim_reward(&challenge_id).await {
        Ok(true) => {}
        // Not completed or already claimed
        Ok(false) => return Err(StatusCode::CONFLICT),
        Err(e) => return Err(failure_status(Some(&e))),
    }

    entry(&session, &challenge_id)
        .await
        .map(Json)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.challenge.refresh().await;
    Json(listing(&session, &ChallengeQuery::default()).await)
}
