use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChallengeProgress, EarningsSummary, ReferralRecord, TrustScoreRow};

/// Record collections that publish row changes on the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    TrustScores,
    EarningsSummaries,
    Referrals,
    ChallengeProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A row image carried on the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", content = "row", rename_all = "snake_case")]
pub enum Row {
    TrustScore(TrustScoreRow),
    EarningsSummary(EarningsSummary),
    Referral(ReferralRecord),
    ChallengeProgress(ChallengeProgress),
}

impl Row {
    pub fn collection(&self) -> Collection {
        match self {
            Self::TrustScore(_) => Collection::TrustScores,
            Self::EarningsSummary(_) => Collection::EarningsSummaries,
            Self::Referral(_) => Collection::Referrals,
            Self::ChallengeProgress(_) => Collection::ChallengeProgress,
        }
    }

    /// The user whose feed filter this row matches. Referrals belong to the referrer.
    pub fn owner_id(&self) -> Uuid {
        match self {
            Self::TrustScore(r) => r.user_id,
            Self::EarningsSummary(r) => r.user_id,
            Self::Referral(r) => r.referrer_id,
            Self::ChallengeProgress(r) => r.user_id,
        }
    }
}

/// Row-level change notification. `old` is only present on updates, and only
/// when the source kept the previous image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeKind,
    pub old: Option<Row>,
    pub new: Row,
}

impl ChangeEvent {
    pub fn insert(new: Row) -> Self {
        Self {
            event_type: ChangeKind::Insert,
            old: None,
            new,
        }
    }

    pub fn update(old: Option<Row>, new: Row) -> Self {
        Self {
            event_type: ChangeKind::Update,
            old,
            new,
        }
    }

    pub fn collection(&self) -> Collection {
        self.new.collection()
    }

    pub fn owner_id(&self) -> Uuid {
        self.new.owner_id()
    }
}

/// Subscription key: one collection, rows owned by one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedFilter {
    pub collection: Collection,
    pub user_id: Uuid,
}

impl FeedFilter {
    pub fn new(collection: Collection, user_id: Uuid) -> Self {
        Self { collection, user_id }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.collection() == self.collection && event.owner_id() == self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ReferralStatus, TrustScoreRow};

    #[test]
    fn test_filter_matches_referrer_not_referred() {
        let referrer = Uuid::new_v4();
        let referred = Uuid::new_v4();
        let event = ChangeEvent::insert(Row::Referral(ReferralRecord {
            id: Uuid::new_v4(),
            referrer_id: referrer,
            referred_user_id: referred,
            referral_code: "ABCD1234".into(),
            status: ReferralStatus::Pending,
            earnings_total: 0.0,
            created_at: chrono::Utc::now(),
        }));

        assert!(FeedFilter::new(Collection::Referrals, referrer).matches(&event));
        assert!(!FeedFilter::new(Collection::Referrals, referred).matches(&event));
        assert!(!FeedFilter::new(Collection::TrustScores, referrer).matches(&event));
    }

    #[test]
    fn test_event_wire_format() {
        let user_id = Uuid::nil();
        let event = ChangeEvent::insert(Row::TrustScore(TrustScoreRow {
            user_id,
            score: 60,
            updated_at: chrono::DateTime::UNIX_EPOCH,
        }));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "insert");
        assert_eq!(json["new"]["collection"], "trust_score");
        assert_eq!(json["new"]["row"]["score"], 60);
        assert!(json["old"].is_null());
    }
}
