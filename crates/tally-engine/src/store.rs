use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tally_types::models::{
    ChallengeProgress, EarningRecord, EarningsSummary, ReferralAggregate, ReferralCode,
    ReferralRecord, TrustHistoryEntry, TrustScoreRow,
};

use crate::error::StoreError;

/// Persistence layer consumed by the trackers.
///
/// Point lookups return `Ok(None)` when the record does not exist yet.
/// No transaction spans two calls; operations that must be atomic are
/// expressed as a single call.
#[async_trait]
pub trait RewardsStore: Send + Sync {
    // -- Trust --

    async fn trust_score(&self, user_id: Uuid) -> Result<Option<TrustScoreRow>, StoreError>;

    /// Newest first, at most `limit` entries.
    async fn trust_history(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError>;

    /// Apply `delta` to the stored score (the default score when the user has
    /// none yet), clamp it, and append the matching history entry, both or
    /// neither. The score is read inside the same write, so a concurrent
    /// change is never overwritten. Returns the entry as written.
    async fn record_trust_change(
        &self,
        user_id: Uuid,
        delta: i32,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TrustHistoryEntry, StoreError>;

    // -- Levels --

    async fn earnings_summary(&self, user_id: Uuid) -> Result<Option<EarningsSummary>, StoreError>;

    /// Completed transactions created at or after `since`.
    async fn completed_earnings_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EarningRecord>, StoreError>;

    // -- Referrals --

    /// The user's currently active referral code.
    async fn referral_code(&self, user_id: Uuid) -> Result<Option<ReferralCode>, StoreError>;

    /// Replace the active code with `code`. Calls repeating a `request_key`
    /// return the code stored by the first call and change nothing.
    async fn rotate_referral_code(
        &self,
        user_id: Uuid,
        request_key: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError>;

    async fn referral_aggregate(
        &self,
        referrer_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<ReferralAggregate, StoreError>;

    /// Newest first.
    async fn referrals(
        &self,
        referrer_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReferralRecord>, StoreError>;

    // -- Challenges --

    async fn challenge_progress(&self, user_id: Uuid) -> Result<Vec<ChallengeProgress>, StoreError>;

    async fn challenge_progress_for(
        &self,
        user_id: Uuid,
        challenge_id: &str,
    ) -> Result<Option<ChallengeProgress>, StoreError>;

    /// Upsert keyed by `(user_id, challenge_id)`.
    async fn upsert_challenge_progress(&self, progress: &ChallengeProgress) -> Result<(), StoreError>;

    /// Mark the reward claimed and credit `points`. Returns `false` without
    /// writing when the row is missing, not completed, or already claimed.
    async fn claim_challenge_reward(
        &self,
        user_id: Uuid,
        challenge_id: &str,
        points: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}
