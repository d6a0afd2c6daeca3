use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error};
use uuid::Uuid;

use tally_engine::{RewardsStore, StoreError};
use tally_feed::Dispatcher;
use tally_types::events::Row;
use tally_types::models::{
    ChallengeProgress, EarningRecord, EarningsSummary, ReferralAggregate, ReferralCode,
    ReferralRecord, ReferralStatus, TransactionStatus, TrustHistoryEntry, TrustScoreRow,
};

use crate::Database;

/// `RewardsStore` over SQLite. Queries run on the blocking pool; every
/// committed write is published on the dispatcher as a change event.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

/// Constraint violations are the caller's fault; anything else is the
/// backend's.
fn store_error(err: anyhow::Error) -> StoreError {
    match err.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Rejected(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

impl SqliteStore {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run blocking DB work off the async runtime.
    async fn run<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Backend(e.to_string())
            })?
            .map_err(store_error)
    }

    // -- Collaborator writes --

    pub async fn record_transaction(
        &self,
        user_id: Uuid,
        amount: f64,
        kind: &str,
        status: TransactionStatus,
    ) -> Result<EarningRecord, StoreError> {
        let kind = kind.to_string();
        self.run(move |db| db.record_transaction(user_id, amount, &kind, status))
            .await
    }

    pub async fn set_lifetime_earnings(
        &self,
        user_id: Uuid,
        amount: f64,
    ) -> Result<EarningsSummary, StoreError> {
        let change = self
            .run(move |db| db.set_lifetime_earnings(user_id, amount))
            .await?;
        let summary = change.new.clone();
        self.dispatcher
            .publish(change.into_event(Row::EarningsSummary))
            .await;
        Ok(summary)
    }

    /// `None` when `code` is not an active referral code.
    pub async fn record_referral(
        &self,
        code: &str,
        referred_user_id: Uuid,
    ) -> Result<Option<ReferralRecord>, StoreError> {
        let code = code.to_string();
        let record = self
            .run(move |db| db.record_referral(&code, referred_user_id))
            .await?;

        if let Some(record) = &record {
            debug!("Referral {} attributed to {}", record.id, record.referrer_id);
            self.dispatcher
                .publish(tally_types::events::ChangeEvent::insert(Row::Referral(record.clone())))
                .await;
        }
        Ok(record)
    }

    pub async fn update_referral(
        &self,
        id: Uuid,
        status: ReferralStatus,
        earnings_total: f64,
    ) -> Result<ReferralRecord, StoreError> {
        let change = self
            .run(move |db| db.update_referral(id, status, earnings_total))
            .await?
            .ok_or(StoreError::NotFound)?;
        let record = change.new.clone();
        self.dispatcher.publish(change.into_event(Row::Referral)).await;
        Ok(record)
    }

    pub async fn record_auto_share(&self, user_id: Uuid, amount: f64) -> Result<(), StoreError> {
        self.run(move |db| db.record_auto_share(user_id, amount)).await
    }
}

#[async_trait]
impl RewardsStore for SqliteStore {
    async fn trust_score(&self, user_id: Uuid) -> Result<Option<TrustScoreRow>, StoreError> {
        self.run(move |db| db.get_trust_score(user_id)).await
    }

    async fn trust_history(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError> {
        self.run(move |db| db.get_trust_history(user_id, limit)).await
    }

    async fn record_trust_change(
        &self,
        user_id: Uuid,
        delta: i32,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TrustHistoryEntry, StoreError> {
        let reason = reason.to_string();
        let (change, entry) = self
            .run(move |db| db.record_trust_change(user_id, delta, &reason, metadata.as_ref()))
            .await?;
        self.dispatcher.publish(change.into_event(Row::TrustScore)).await;
        Ok(entry)
    }

    async fn earnings_summary(&self, user_id: Uuid) -> Result<Option<EarningsSummary>, StoreError> {
        self.run(move |db| db.get_earnings_summary(user_id)).await
    }

    async fn completed_earnings_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EarningRecord>, StoreError> {
        self.run(move |db| db.get_completed_earnings_since(user_id, since))
            .await
    }

    async fn referral_code(&self, user_id: Uuid) -> Result<Option<ReferralCode>, StoreError> {
        self.run(move |db| db.get_referral_code(user_id)).await
    }

    async fn rotate_referral_code(
        &self,
        user_id: Uuid,
        request_key: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError> {
        let code = code.to_string();
        let (active, created) = self
            .run(move |db| db.rotate_referral_code(user_id, request_key, &code))
            .await?;
        if !created {
            debug!("Replayed code rotation {} for {}", request_key, user_id);
        }
        Ok(active)
    }

    async fn referral_aggregate(
        &self,
        referrer_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<ReferralAggregate, StoreError> {
        self.run(move |db| db.referral_aggregate(referrer_id, month_start))
            .await
    }

    async fn referrals(
        &self,
        referrer_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReferralRecord>, StoreError> {
        self.run(move |db| db.get_referrals(referrer_id, offset, limit))
            .await
    }

    async fn challenge_progress(&self, user_id: Uuid) -> Result<Vec<ChallengeProgress>, StoreError> {
        self.run(move |db| db.get_challenge_progress(user_id)).await
    }

    async fn challenge_progress_for(
        &self,
        user_id: Uuid,
        challenge_id: &str,
    ) -> Result<Option<ChallengeProgress>, StoreError> {
        let challenge_id = challenge_id.to_string();
        self.run(move |db| db.get_challenge_progress_for(user_id, &challenge_id))
            .await
    }

    async fn upsert_challenge_progress(&self, progress: &ChallengeProgress) -> Result<(), StoreError> {
        let progress = progress.clone();
        let change = self
            .run(move |db| db.upsert_challenge_progress(&progress))
            .await?;
        self.dispatcher
            .publish(change.into_event(Row::ChallengeProgress))
            .await;
        Ok(())
    }

    async fn claim_challenge_reward(
        &self,
        user_id: Uuid,
        challenge_id: &str,
        points: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let challenge_id = challenge_id.to_string();
        let change = self
            .run(move |db| db.claim_challenge_reward(user_id, &challenge_id, points, claimed_at))
            .await?;

        match change {
            Some(change) => {
                self.dispatcher
                    .publish(change.into_event(Row::ChallengeProgress))
                    .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tally_engine::ChangeFeed;
    use tally_types::events::{ChangeKind, Collection, FeedFilter};
    use tally_types::models::ChallengeStatus;

    fn store() -> SqliteStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        SqliteStore::new(db, Dispatcher::new())
    }

    #[tokio::test]
    async fn test_writes_publish_change_events() {
        let store = store();
        let user = Uuid::new_v4();
        let mut feed = store
            .dispatcher()
            .subscribe(FeedFilter::new(Collection::TrustScores, user))
            .await
            .unwrap();

        store.record_trust_change(user, 8, "test", None).await.unwrap();
        store.record_trust_change(user, 3, "test", None).await.unwrap();

        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.event_type, ChangeKind::Insert);
        let second = feed.next().await.unwrap().unwrap();
        assert_eq!(second.event_type, ChangeKind::Update);
        match (second.old, second.new) {
            (Some(Row::TrustScore(old)), Row::TrustScore(new)) => {
                assert_eq!(old.score, 58);
                assert_eq!(new.score, 61);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_constraint_violation_is_rejected() {
        let store = store();
        let user = Uuid::new_v4();
        store.rotate_referral_code(user, Uuid::new_v4(), "SAME2345").await.unwrap();

        // Codes are globally unique
        let err = store
            .rotate_referral_code(Uuid::new_v4(), Uuid::new_v4(), "SAME2345")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_referral_lifecycle_events() {
        let store = store();
        let referrer = Uuid::new_v4();
        store.rotate_referral_code(referrer, Uuid::new_v4(), "LIFE2345").await.unwrap();
        let mut feed = store
            .dispatcher()
            .subscribe(FeedFilter::new(Collection::Referrals, referrer))
            .await
            .unwrap();

        let record = store
            .record_referral("LIFE2345", Uuid::new_v4())
            .await
            .unwrap()
            .unwrap();
        store
            .update_referral(record.id, ReferralStatus::Active, 12.0)
            .await
            .unwrap();
        assert_eq!(
            store
                .update_referral(Uuid::new_v4(), ReferralStatus::Active, 1.0)
                .await
                .unwrap_err(),
            StoreError::NotFound
        );

        assert_eq!(feed.next().await.unwrap().unwrap().event_type, ChangeKind::Insert);
        let update = feed.next().await.unwrap().unwrap();
        assert_eq!(update.event_type, ChangeKind::Update);
        assert!(update.old.is_some());
    }

    #[tokio::test]
    async fn test_claim_publishes_only_when_claimed() {
        let store = store();
        let user = Uuid::new_v4();
        assert!(!store.claim_challenge_reward(user, "first-sale", 150, Utc::now()).await.unwrap());

        let progress = ChallengeProgress {
            id: Uuid::new_v4(),
            user_id: user,
            challenge_id: "first-sale".into(),
            progress: 1,
            target_value: 1,
            status: ChallengeStatus::Completed,
            completion_date: Some(Utc::now()),
            reward_claimed: false,
            claim_date: None,
        };
        store.upsert_challenge_progress(&progress).await.unwrap();
        assert!(store.claim_challenge_reward(user, "first-sale", 150, Utc::now()).await.unwrap());
        assert!(!store.claim_challenge_reward(user, "first-sale", 150, Utc::now()).await.unwrap());

        // One upsert, one claim
        assert_eq!(store.dispatcher().published(), 2);
    }

    #[tokio::test]
    async fn test_trackers_over_sqlite() {
        use tally_engine::mock::{RecordingClipboard, RecordingNotifier, settle};
        use tally_engine::{ChallengeTracker, EngineConfig, EngineContext, Tracker, TrustTracker};

        let store = store();
        let notifier = Arc::new(RecordingNotifier::default());
        let ctx = EngineContext {
            user_id: Uuid::new_v4(),
            store: Arc::new(store.clone()),
            feed: Arc::new(store.dispatcher().clone()),
            notifier: notifier.clone(),
            clipboard: Arc::new(RecordingClipboard::default()),
            config: EngineConfig::default(),
        };

        let trust = TrustTracker::new(ctx.clone());
        assert!(trust.update_score(5, "completed_kyc", None).await);
        let score = trust.snapshot().await.data.unwrap();
        assert_eq!(score.current_score, 55);
        assert_eq!(score.history.len(), 1);

        let challenges = ChallengeTracker::new(ctx);
        challenges.fetch().await;
        let _sub = challenges.subscribe().await.unwrap();

        assert!(challenges.update_progress("community-voice", 40).await);
        assert!(challenges.update_progress("community-voice", 100).await);
        settle().await;
        assert_eq!(challenges.unclaimed_challenges().await.len(), 1);

        assert!(challenges.claim_reward("community-voice").await);
        assert!(challenges.unclaimed_challenges().await.is_empty());

        let toasts = notifier.take();
        assert!(toasts.iter().any(|n| n.title == "Challenge completed!"));
        assert!(toasts.iter().any(|n| n.title == "Reward claimed!"));
    }
}
