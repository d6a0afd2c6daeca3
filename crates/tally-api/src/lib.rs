pub mod challenges;
pub mod level;
pub mod notifications;
pub mod referrals;
pub mod session;
pub mod state;
pub mod trust;

use axum::{
    Router,
    routing::{delete, get, post},
};

pub use state::{AppState, AppStateInner, DEFAULT_SESSION_IDLE, run_session_sweeper};

/// Every per-user route. Identity comes from the path.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/users/{user_id}/trust", get(trust::get_trust))
        .route("/users/{user_id}/trust/score", post(trust::update_score))
        .route("/users/{user_id}/trust/history", get(trust::get_history))
        .route("/users/{user_id}/trust/can", get(trust::can_perform))
        .route("/users/{user_id}/trust/refresh", post(trust::refresh))
        .route("/users/{user_id}/level", get(level::get_level))
        .route("/users/{user_id}/level/table", get(level::level_table))
        .route("/users/{user_id}/level/refresh", post(level::refresh))
        .route("/users/{user_id}/referrals", get(referrals::get_referrals))
        .route("/users/{user_id}/referrals/more", post(referrals::load_more))
        .route("/users/{user_id}/referrals/code", post(referrals::generate_code))
        .route("/users/{user_id}/referrals/code/copy", post(referrals::copy_code))
        .route("/users/{user_id}/referrals/refresh", post(referrals::refresh))
        .route("/users/{user_id}/challenges", get(challenges::list_challenges))
        .route(
            "/users/{user_id}/challenges/{challenge_id}/progress",
            post(challenges::update_progress),
        )
        .route(
            "/users/{user_id}/challenges/{challenge_id}/claim",
            post(challenges::claim_reward),
        )
        .route("/users/{user_id}/challenges/refresh", post(challenges::refresh))
        .route("/users/{user_id}/notifications", get(notifications::drain))
        .route("/users/{user_id}/session", delete(notifications::end_session))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;
    use uuid::Uuid;

    use tally_db::{Database, SqliteStore};
    use tally_engine::EngineConfig;
    use tally_feed::Dispatcher;

    use super::*;

    fn test_state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteStore::new(Arc::new(db), Dispatcher::new());
        Arc::new(AppStateInner::new(store, EngineConfig::default()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_trust_update_roundtrip() {
        let app = router(test_state());
        let user = Uuid::new_v4();

        let (status, body) = send(&app, "GET", &format!("/users/{user}/trust"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "ready");
        let start = body["data"]["current_score"].as_i64().unwrap();

        let (status, body) = send(
            &app,
            "POST",
            &format!("/users/{user}/trust/score"),
            Some(json!({ "delta": 5, "reason": "verified email" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["current_score"].as_i64().unwrap(), start + 5);

        let (_, history) = send(&app, "GET", &format!("/users/{user}/trust/history?limit=10"), None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["reason"], "verified email");

        let (_, can) = send(&app, "GET", &format!("/users/{user}/trust/can?required=101"), None).await;
        assert_eq!(can["allowed"], false);
    }

    #[tokio::test]
    async fn test_blank_reason_is_rejected() {
        let app = router(test_state());
        let (status, _) = send(
            &app,
            "POST",
            &format!("/users/{}/trust/score", Uuid::new_v4()),
            Some(json!({ "delta": 5, "reason": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_challenge_claim_flow() {
        let app = router(test_state());
        let user = Uuid::new_v4();
        let base = format!("/users/{user}/challenges");

        let (status, _) = send(&app, "POST", &format!("{base}/first-sale/claim"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(
            &app,
            "POST",
            &format!("{base}/first-sale/progress"),
            Some(json!({ "progress": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_progress"]["status"], "completed");

        let (_, listing) = send(&app, "GET", &format!("{base}?status=completed"), None).await;
        assert_eq!(listing["challenges"].as_array().unwrap().len(), 1);
        assert_eq!(listing["total_rewards_available"], 150);

        let (status, body) = send(&app, "POST", &format!("{base}/first-sale/claim"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user_progress"]["reward_claimed"], true);

        let (status, _) = send(&app, "POST", &format!("{base}/first-sale/claim"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "POST",
            &format!("{base}/first-sale/progress"),
            Some(json!({ "progress": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, toasts) = send(&app, "GET", &format!("/users/{user}/notifications"), None).await;
        let titles: Vec<_> = toasts
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["title"].as_str().unwrap().to_string())
            .collect();
        assert!(titles.contains(&"Reward claimed!".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_challenge_is_not_found() {
        let app = router(test_state());
        let (status, _) = send(
            &app,
            "POST",
            &format!("/users/{}/challenges/no-such-thing/progress", Uuid::new_v4()),
            Some(json!({ "progress": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_level_follows_earnings() {
        let state = test_state();
        let app = router(state.clone());
        let user = Uuid::new_v4();

        let (_, body) = send(&app, "GET", &format!("/users/{user}/level"), None).await;
        assert_eq!(body["data"]["current_level"], 1);

        state.store.set_lifetime_earnings(user, 600.0).await.unwrap();
        let (_, body) = send(&app, "POST", &format!("/users/{user}/level/refresh"), None).await;
        assert_eq!(body["data"]["current_level"], 3);

        let (_, table) = send(&app, "GET", &format!("/users/{user}/level/table"), None).await;
        let table = table.as_array().unwrap();
        assert_eq!(table.len(), tally_types::tables::LEVELS.len());
        assert_eq!(table[2]["unlocked"], true);
        assert_eq!(table[3]["unlocked"], false);
        assert_eq!(table[0]["progress"], 100.0);
    }

    #[tokio::test]
    async fn test_referral_code_generate_and_copy() {
        let app = router(test_state());
        let user = Uuid::new_v4();

        let (status, _) = send(&app, "POST", &format!("/users/{user}/referrals/code/copy"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&app, "POST", &format!("/users/{user}/referrals/code"), None).await;
        assert_eq!(status, StatusCode::OK);
        let code = body["referrals"]["data"]["referral_code"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 8);
        assert_eq!(body["tier"]["name"], "Bronze");

        let (status, body) = send(&app, "POST", &format!("/users/{user}/referrals/code/copy"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["copied"], code);

        let (_, body) = send(&app, "POST", &format!("/users/{user}/referrals/more"), None).await;
        assert_eq!(body["appended"], false);
    }

    #[tokio::test]
    async fn test_sessions_are_reused_and_closed() {
        let state = test_state();
        let app = router(state.clone());
        let user = Uuid::new_v4();

        send(&app, "GET", &format!("/users/{user}/trust"), None).await;
        send(&app, "GET", &format!("/users/{user}/level"), None).await;
        assert_eq!(state.session_count().await, 1);
        assert_eq!(state.store.dispatcher().subscriber_count().await, 4);

        let (status, _) = send(&app, "DELETE", &format!("/users/{user}/session"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.session_count().await, 0);

        let (status, _) = send(&app, "DELETE", &format!("/users/{user}/session"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    async fn listeners_settle(state: &AppState, expected: usize) {
        while state.store.dispatcher().subscriber_count().await != expected {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let db = Database::open_in_memory().unwrap();
        let store = SqliteStore::new(Arc::new(db), Dispatcher::new());
        let state: AppState = Arc::new(
            AppStateInner::new(store, EngineConfig::default()).with_idle_timeout(Duration::from_secs(15 * 60)),
        );
        let app = router(state.clone());
        let (busy, idle) = (Uuid::new_v4(), Uuid::new_v4());

        send(&app, "GET", &format!("/users/{busy}/trust"), None).await;
        send(&app, "GET", &format!("/users/{idle}/trust"), None).await;
        assert_eq!(state.session_count().await, 2);
        assert_eq!(state.store.dispatcher().subscriber_count().await, 8);

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        // Served from the open session, which counts as use
        state.session(busy).await;
        assert_eq!(state.evict_idle().await, 0);

        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        assert_eq!(state.evict_idle().await, 1);
        assert_eq!(state.session_count().await, 1);
        listeners_settle(&state, 4).await;

        tokio::time::advance(Duration::from_secs(15 * 60)).await;
        assert_eq!(state.evict_idle().await, 1);
        assert_eq!(state.session_count().await, 0);
        listeners_settle(&state, 0).await;
    }

    #[tokio::test]
    async fn test_claim_with_nothing_to_claim_ignores_earlier_failure() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let store = SqliteStore::new(db.clone(), Dispatcher::new());
        let app = router(Arc::new(AppStateInner::new(store, EngineConfig::default())));
        let base = format!("/users/{}/challenges", Uuid::new_v4());
        let rename = |from: &str, to: &str| {
            let sql = format!("ALTER TABLE {from} RENAME TO {to}");
            db.with_conn(|conn| Ok(conn.execute_batch(&sql)?)).unwrap();
        };

        // Leave a failed write behind on the challenge tracker
        rename("challenge_progress", "challenge_progress_offline");
        let (status, _) = send(
            &app,
            "POST",
            &format!("{base}/daily-engager/progress"),
            Some(json!({ "progress": 3 })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        rename("challenge_progress_offline", "challenge_progress");

        let (status, _) = send(&app, "POST", &format!("{base}/first-sale/claim"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_tracker_refresh_is_not_found() {
        let app = router(test_state());
        let (status, _) = send(&app, "POST", &format!("/users/{}/badges/refresh", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
