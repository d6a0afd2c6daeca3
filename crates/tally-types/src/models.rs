use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tables::{self, ChallengeDefinition, LevelThreshold, TierInfo};

// -- Trust --

pub const MAX_TRUST_SCORE: i32 = 100;
pub const MIN_TRUST_SCORE: i32 = 0;

/// Score assumed for users that have no trust record yet.
pub const DEFAULT_TRUST_SCORE: i32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    Low,
    Medium,
    High,
    Excellent,
}

impl TrustLevel {
    /// Lower bounds are inclusive: 50 is medium, 70 is high, 85 is excellent.
    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 85 => Self::Excellent,
            s if s >= 70 => Self::High,
            s if s >= 50 => Self::Medium,
            _ => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Improving,
    Stable,
    Declining,
}

impl Trend {
    /// Mean delta over the newest `window` entries of a newest-first history.
    pub fn from_history(history: &[TrustHistoryEntry], window: usize) -> Self {
        let recent: Vec<i32> = history.iter().take(window).map(|h| h.delta()).collect();
        if recent.is_empty() {
            return Self::Stable;
        }

        let mean = recent.iter().map(|d| f64::from(*d)).sum::<f64>() / recent.len() as f64;
        if mean > 1.0 {
            Self::Improving
        } else if mean < -1.0 {
            Self::Declining
        } else {
            Self::Stable
        }
    }
}

pub fn clamp_trust_score(raw: i64) -> i32 {
    raw.clamp(i64::from(MIN_TRUST_SCORE), i64::from(MAX_TRUST_SCORE)) as i32
}

/// One applied score change. `new_score` is the score that became current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustHistoryEntry {
    pub old_score: i32,
    pub new_score: i32,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl TrustHistoryEntry {
    pub fn delta(&self) -> i32 {
        self.new_score - self.old_score
    }
}

/// The persisted current-score row, as carried on the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScoreRow {
    pub user_id: Uuid,
    pub score: i32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub current_score: i32,
    pub max_score: i32,
    pub percentile: i32,
    pub trust_level: TrustLevel,
    /// Newest first.
    pub history: Vec<TrustHistoryEntry>,
    pub trend: Trend,
}

impl TrustScore {
    pub fn from_parts(score: i32, history: Vec<TrustHistoryEntry>, trend_window: usize) -> Self {
        let current_score = clamp_trust_score(i64::from(score));
        let trend = Trend::from_history(&history, trend_window);
        Self {
            current_score,
            max_score: MAX_TRUST_SCORE,
            percentile: current_score,
            trust_level: TrustLevel::from_score(current_score),
            history,
            trend,
        }
    }
}

// -- Levels & earnings --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsSummary {
    pub user_id: Uuid,
    pub lifetime_earnings: f64,
    /// Absent when the summary writer has not assigned a level yet.
    pub current_level: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub kind: String,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LevelProgression {
    pub current_level: u32,
    pub title: &'static str,
    pub color: &'static str,
    pub multiplier: f64,
    pub benefits: &'static [&'static str],
    pub lifetime_earnings: f64,
    pub current_threshold: f64,
    pub next_threshold: Option<f64>,
    pub progress_percentage: f64,
    pub is_max_level: bool,
    /// Earnings per day over the trailing window, never zero.
    pub earning_velocity: f64,
    /// `None` when there is no next level to reach.
    pub estimated_days_to_next_level: Option<u32>,
}

impl LevelProgression {
    pub fn compute(lifetime_earnings: f64, level: &'static LevelThreshold, earning_velocity: f64) -> Self {
        let next = tables::level_info(level.level + 1);
        let next_threshold = next.map(|n| n.threshold);

        let progress_percentage = match next {
            Some(n) => {
                let span = n.threshold - level.threshold;
                ((lifetime_earnings - level.threshold) / span * 100.0).clamp(0.0, 100.0)
            }
            None => 100.0,
        };

        let estimated_days_to_next_level = next_threshold.map(|t| {
            let remaining = (t - lifetime_earnings).max(0.0);
            (remaining / earning_velocity).ceil() as u32
        });

        Self {
            current_level: level.level,
            title: level.title,
            color: level.color,
            multiplier: level.multiplier,
            benefits: level.benefits,
            lifetime_earnings,
            current_threshold: level.threshold,
            next_threshold,
            progress_percentage,
            is_max_level: next.is_none(),
            earning_velocity,
            estimated_days_to_next_level,
        }
    }
}

// -- Referrals --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralStatus {
    Pending,
    Active,
}

impl ReferralStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralRecord {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_user_id: Uuid,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub earnings_total: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralCode {
    pub user_id: Uuid,
    pub code: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

/// Raw counters as read from the store, before any derived fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferralAggregate {
    pub total_referrals: u32,
    pub active_referrals: u32,
    pub total_earnings: f64,
    pub earnings_this_month: f64,
    /// Supplied by the revenue-sharing service; read-only here.
    pub total_auto_shared: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralStats {
    pub total_referrals: u32,
    pub active_referrals: u32,
    pub total_earnings: f64,
    pub earnings_this_month: f64,
    pub total_auto_shared: f64,
    pub conversion_rate: f64,
    pub tier: ReferralTier,
}

impl ReferralStats {
    pub fn from_aggregate(agg: &ReferralAggregate) -> Self {
        let mut stats = Self {
            total_referrals: agg.total_referrals,
            active_referrals: agg.active_referrals.min(agg.total_referrals),
            total_earnings: agg.total_earnings,
            earnings_this_month: agg.earnings_this_month,
            total_auto_shared: agg.total_auto_shared,
            conversion_rate: 0.0,
            tier: ReferralTier::Bronze,
        };
        stats.recompute();
        stats
    }

    /// Re-derive conversion rate and tier after the counters were patched.
    pub fn recompute(&mut self) {
        self.active_referrals = self.active_referrals.min(self.total_referrals);
        self.conversion_rate = if self.total_referrals == 0 {
            0.0
        } else {
            f64::from(self.active_referrals) / f64::from(self.total_referrals)
        };
        self.tier = tables::tier_for_referrals(self.total_referrals);
    }

    pub fn tier_info(&self) -> &'static TierInfo {
        tables::tier_info(self.tier)
    }

    pub fn next_tier_info(&self) -> Option<&'static TierInfo> {
        tables::next_tier(self.tier)
    }

    /// Earnings relative to the next tier's earnings floor, saturating at 100.
    pub fn progress_to_next_tier(&self) -> u32 {
        match self.next_tier_info() {
            Some(next) if next.min_earnings > 0.0 => {
                let pct = (self.total_earnings / next.min_earnings * 100.0).round();
                pct.clamp(0.0, 100.0) as u32
            }
            _ => 100,
        }
    }
}

// -- Challenges --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Active,
    Completed,
}

impl ChallengeStatus {
    pub fn for_progress(progress: i64, target_value: i64) -> Self {
        if progress >= target_value {
            Self::Completed
        } else {
            Self::Active
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeProgress {
    pub id: Uuid,
    pub user_id: Uuid,
    pub challenge_id: String,
    pub progress: i64,
    pub target_value: i64,
    pub status: ChallengeStatus,
    pub completion_date: Option<DateTime<Utc>>,
    pub reward_claimed: bool,
    pub claim_date: Option<DateTime<Utc>>,
}

impl ChallengeProgress {
    pub fn is_claimable(&self) -> bool {
        self.status == ChallengeStatus::Completed && !self.reward_claimed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeWithProgress {
    pub challenge: &'static ChallengeDefinition,
    /// `None` until the user has made any progress.
    pub user_progress: Option<ChallengeProgress>,
}

impl ChallengeWithProgress {
    pub fn status(&self) -> Option<ChallengeStatus> {
        self.user_progress.as_ref().map(|p| p.status)
    }

    pub fn is_unclaimed(&self) -> bool {
        self.user_progress.as_ref().is_some_and(ChallengeProgress::is_claimable)
    }
}
