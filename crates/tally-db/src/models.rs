//! Database row types. These map directly to SQLite rows and stay separate
//! from the tally-types models so the schema can evolve on its own.
//! Timestamps are stored as RFC 3339 text at microsecond precision, which
//! sorts correctly as a string.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use uuid::Uuid;

use tally_types::models::{
    ChallengeProgress, ChallengeStatus, EarningRecord, EarningsSummary, ReferralCode,
    ReferralRecord, ReferralStatus, TransactionStatus, TrustHistoryEntry, TrustScoreRow,
};

/// Current time at the precision the database keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("bad timestamp {:?}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_id(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).with_context(|| format!("bad id {:?}", s))
}

pub struct ScoreRow {
    pub user_id: String,
    pub score: i32,
    pub updated_at: String,
}

impl ScoreRow {
    pub fn into_model(self) -> Result<TrustScoreRow> {
        Ok(TrustScoreRow {
            user_id: parse_id(&self.user_id)?,
            score: self.score,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

pub struct HistoryRow {
    pub old_score: i32,
    pub new_score: i32,
    pub reason: String,
    pub metadata: Option<String>,
    pub created_at: String,
}

impl HistoryRow {
    pub fn into_model(self) -> Result<TrustHistoryEntry> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .context("bad trust history metadata")?;
        Ok(TrustHistoryEntry {
            old_score: self.old_score,
            new_score: self.new_score,
            reason: self.reason,
            metadata,
            timestamp: parse_ts(&self.created_at)?,
        })
    }
}

pub struct SummaryRow {
    pub user_id: String,
    pub lifetime_earnings: f64,
    pub current_level: Option<u32>,
    pub updated_at: String,
}

impl SummaryRow {
    pub fn into_model(self) -> Result<EarningsSummary> {
        Ok(EarningsSummary {
            user_id: parse_id(&self.user_id)?,
            lifetime_earnings: self.lifetime_earnings,
            current_level: self.current_level,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

pub struct TransactionRow {
    pub id: String,
    pub user_id: String,
    pub amount: f64,
    pub kind: String,
    pub status: String,
    pub created_at: String,
}

impl TransactionRow {
    pub fn into_model(self) -> Result<EarningRecord> {
        Ok(EarningRecord {
            id: parse_id(&self.id)?,
            user_id: parse_id(&self.user_id)?,
            amount: self.amount,
            kind: self.kind,
            status: TransactionStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("bad transaction status {:?}", self.status))?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct CodeRow {
    pub user_id: String,
    pub code: String,
    pub created_at: String,
}

impl CodeRow {
    pub fn into_model(self) -> Result<ReferralCode> {
        Ok(ReferralCode {
            user_id: parse_id(&self.user_id)?,
            code: self.code,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct ReferralRow {
    pub id: String,
    pub referrer_id: String,
    pub referred_user_id: String,
    pub referral_code: String,
    pub status: String,
    pub earnings_total: f64,
    pub created_at: String,
}

impl ReferralRow {
    pub fn into_model(self) -> Result<ReferralRecord> {
        Ok(ReferralRecord {
            id: parse_id(&self.id)?,
            referrer_id: parse_id(&self.referrer_id)?,
            referred_user_id: parse_id(&self.referred_user_id)?,
            referral_code: self.referral_code,
            status: ReferralStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("bad referral status {:?}", self.status))?,
            earnings_total: self.earnings_total,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

pub struct ProgressRow {
    pub id: String,
    pub user_id: String,
    pub challenge_id: String,
    pub progress: i64,
    pub target_value: i64,
    pub status: String,
    pub completion_date: Option<String>,
    pub reward_claimed: bool,
    pub claim_date: Option<String>,
}

impl ProgressRow {
    pub fn into_model(self) -> Result<ChallengeProgress> {
        Ok(ChallengeProgress {
            id: parse_id(&self.id)?,
            user_id: parse_id(&self.user_id)?,
            challenge_id: self.challenge_id,
            progress: self.progress,
            target_value: self.target_value,
            status: ChallengeStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("bad challenge status {:?}", self.status))?,
            completion_date: parse_opt_ts(self.completion_date)?,
            reward_claimed: self.reward_claimed,
            claim_date: parse_opt_ts(self.claim_date)?,
        })
    }
}
