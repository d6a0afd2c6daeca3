use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde::Serialize;
use uuid::Uuid;

use tally_engine::{LevelTracker, Tracker};
use tally_types::tables::LevelThreshold;

use crate::state::AppState;

/// One row of the level table as seen by a particular user.
#[derive(Debug, Serialize)]
pub struct LevelEntry {
    #[serde(flatten)]
    pub level: &'static LevelThreshold,
    pub unlocked: bool,
    pub progress: f64,
    pub estimated_days: Option<u32>,
}

pub async fn get_level(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.level.fetch(false).await;
    Json(session.engine.level.snapshot().await)
}

pub async fn level_table(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    let tracker = &session.engine.level;
    tracker.fetch(false).await;

    let mut entries = Vec::with_capacity(LevelTracker::all_levels().len());
    for level in LevelTracker::all_levels() {
        entries.push(LevelEntry {
            level,
            unlocked: tracker.is_level_unlocked(level.level).await,
            progress: tracker.progress_toward_level(level.level).await,
            estimated_days: tracker.estimate_time_to_level(level.level).await,
        });
    }
    Json(entries)
}

pub async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> impl IntoResponse {
    let session = state.session(user_id).await;
    session.engine.level.refresh().await;
    Json(session.engine.level.snapshot().await)
}
