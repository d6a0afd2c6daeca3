use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row as SqlRow, params};
use uuid::Uuid;

use tally_types::events::{ChangeEvent, Row};
use tally_types::models::{
    ChallengeProgress, DEFAULT_TRUST_SCORE, EarningRecord, EarningsSummary, ReferralAggregate,
    ReferralCode, ReferralRecord, ReferralStatus, TransactionStatus, TrustHistoryEntry,
    TrustScoreRow, clamp_trust_score,
};
use tally_types::tables;

use crate::Database;
use crate::models::{
    CodeRow, HistoryRow, ProgressRow, ReferralRow, ScoreRow, SummaryRow, TransactionRow, fmt_ts,
    now,
};

/// A row before and after a write.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub old: Option<T>,
    pub new: T,
}

impl<T> Change<T> {
    pub fn into_event(self, wrap: fn(T) -> Row) -> ChangeEvent {
        match self.old {
            Some(old) => ChangeEvent::update(Some(wrap(old)), wrap(self.new)),
            None => ChangeEvent::insert(wrap(self.new)),
        }
    }
}

const SCORE_COLUMNS: &str = "user_id, score, updated_at";
const SUMMARY_COLUMNS: &str = "user_id, lifetime_earnings, current_level, updated_at";
const REFERRAL_COLUMNS: &str =
    "id, referrer_id, referred_user_id, referral_code, status, earnings_total, created_at";
const PROGRESS_COLUMNS: &str = "id, user_id, challenge_id, progress, target_value, status, \
     completion_date, reward_claimed, claim_date";

impl Database {
    // -- Trust --

    pub fn get_trust_score(&self, user_id: Uuid) -> Result<Option<TrustScoreRow>> {
        self.with_conn(|conn| query_trust_score(conn, user_id))
    }

    pub fn get_trust_history(&self, user_id: Uuid, limit: usize) -> Result<Vec<TrustHistoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT old_score, new_score, reason, metadata, created_at FROM trust_history
                 WHERE user_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;

            let rows = stmt
                .query_map(params![user_id.to_string(), limit as i64], |row| {
                    Ok(HistoryRow {
                        old_score: row.get(0)?,
                        new_score: row.get(1)?,
                        reason: row.get(2)?,
                        metadata: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(HistoryRow::into_model).collect()
        })
    }

    /// Apply `delta` to the stored score and append the history entry in one
    /// transaction. The old score is read inside the transaction, so a
    /// concurrent writer is never overwritten.
    pub fn record_trust_change(
        &self,
        user_id: Uuid,
        delta: i32,
        reason: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(Change<TrustScoreRow>, TrustHistoryEntry)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let old = query_trust_score(&tx, user_id)?;
            let old_score = old.as_ref().map_or(DEFAULT_TRUST_SCORE, |r| r.score);

            let entry = TrustHistoryEntry {
                old_score,
                new_score: clamp_trust_score(i64::from(old_score) + i64::from(delta)),
                reason: reason.to_string(),
                metadata: metadata.cloned(),
                timestamp: now(),
            };

            tx.execute(
                "INSERT INTO trust_history (id, user_id, old_score, new_score, reason, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id.to_string(),
                    entry.old_score,
                    entry.new_score,
                    entry.reason,
                    metadata.map(|m| m.to_string()),
                    fmt_ts(&entry.timestamp),
                ],
            )?;

            let new = TrustScoreRow {
                user_id,
                score: entry.new_score,
                updated_at: entry.timestamp,
            };
            tx.execute(
                "INSERT INTO trust_scores (user_id, score, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET score = excluded.score, updated_at = excluded.updated_at",
                params![user_id.to_string(), new.score, fmt_ts(&new.updated_at)],
            )?;

            tx.commit()?;
            Ok((Change { old, new }, entry))
        })
    }

    // -- Earnings --

    pub fn get_earnings_summary(&self, user_id: Uuid) -> Result<Option<EarningsSummary>> {
        self.with_conn(|conn| query_earnings_summary(conn, user_id))
    }

    /// Set lifetime earnings and the level they map to.
    pub fn set_lifetime_earnings(&self, user_id: Uuid, amount: f64) -> Result<Change<EarningsSummary>> {
        if !amount.is_finite() || amount < 0.0 {
            bail!("lifetime earnings must be a non-negative amount, got {}", amount);
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let old = query_earnings_summary(&tx, user_id)?;
            let new = EarningsSummary {
                user_id,
                lifetime_earnings: amount,
                current_level: Some(tables::level_for_earnings(amount).level),
                updated_at: now(),
            };

            tx.execute(
                "INSERT INTO earnings_summaries (user_id, lifetime_earnings, current_level, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET lifetime_earnings = excluded.lifetime_earnings,
                     current_level = excluded.current_level, updated_at = excluded.updated_at",
                params![user_id.to_string(), amount, new.current_level, fmt_ts(&new.updated_at)],
            )?;

            tx.commit()?;
            Ok(Change { old, new })
        })
    }

    pub fn record_transaction(
        &self,
        user_id: Uuid,
        amount: f64,
        kind: &str,
        status: TransactionStatus,
    ) -> Result<EarningRecord> {
        let record = EarningRecord {
            id: Uuid::new_v4(),
            user_id,
            amount,
            kind: kind.to_string(),
            status,
            created_at: now(),
        };

        self.with_conn(|conn| {
            insert_transaction(conn, &record)?;
            Ok(record)
        })
    }

    pub fn get_completed_earnings_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EarningRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, amount, kind, status, created_at FROM transactions
                 WHERE user_id = ?1 AND status = 'completed' AND created_at >= ?2
                 ORDER BY created_at DESC",
            )?;

            let rows = stmt
                .query_map(params![user_id.to_string(), fmt_ts(&since)], |row| {
                    Ok(TransactionRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        kind: row.get(3)?,
                        status: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(TransactionRow::into_model).collect()
        })
    }

    // -- Referral codes --

    pub fn get_referral_code(&self, user_id: Uuid) -> Result<Option<ReferralCode>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, code, created_at FROM referral_codes
                     WHERE user_id = ?1 AND active = 1",
                    [user_id.to_string()],
                    code_row,
                )
                .optional()?;
            row.map(CodeRow::into_model).transpose()
        })
    }

    /// Deactivate the current code and activate `code`. A repeated
    /// `request_key` returns the code its first call stored. Returns the
    /// active code and whether this call created it.
    pub fn rotate_referral_code(
        &self,
        user_id: Uuid,
        request_key: Uuid,
        code: &str,
    ) -> Result<(ReferralCode, bool)> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let existing = tx
                .query_row(
                    "SELECT user_id, code, created_at FROM referral_codes WHERE request_key = ?1",
                    [request_key.to_string()],
                    code_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                let existing = existing.into_model()?;
                if existing.user_id != user_id {
                    bail!("request key {} belongs to another user", request_key);
                }
                return Ok((existing, false));
            }

            let created = ReferralCode {
                user_id,
                code: code.to_string(),
                created_at: now(),
            };
            tx.execute(
                "UPDATE referral_codes SET active = 0 WHERE user_id = ?1 AND active = 1",
                [user_id.to_string()],
            )?;
            tx.execute(
                "INSERT INTO referral_codes (id, user_id, code, request_key, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    user_id.to_string(),
                    code,
                    request_key.to_string(),
                    fmt_ts(&created.created_at),
                ],
            )?;

            tx.commit()?;
            Ok((created, true))
        })
    }

    // -- Referrals --

    pub fn referral_aggregate(
        &self,
        referrer_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<ReferralAggregate> {
        self.with_conn(|conn| {
            let referrer = referrer_id.to_string();
            let (total, active, total_earnings, earnings_this_month): (i64, i64, f64, f64) = conn
                .query_row(
                    "SELECT COUNT(*),
                            COALESCE(SUM(status = 'active'), 0),
                            COALESCE(SUM(earnings_total), 0.0),
                            COALESCE(SUM(CASE WHEN created_at >= ?2 THEN earnings_total END), 0.0)
                     FROM referrals WHERE referrer_id = ?1",
                    params![referrer, fmt_ts(&month_start)],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;

            let total_auto_shared: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0.0) FROM auto_share_earnings WHERE user_id = ?1",
                [&referrer],
                |row| row.get(0),
            )?;

            Ok(ReferralAggregate {
                total_referrals: u32::try_from(total)?,
                active_referrals: u32::try_from(active)?,
                total_earnings,
                earnings_this_month,
                total_auto_shared,
            })
        })
    }

    /// Newest first.
    pub fn get_referrals(
        &self,
        referrer_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReferralRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM referrals WHERE referrer_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                REFERRAL_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![referrer_id.to_string(), limit as i64, offset as i64],
                    referral_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(ReferralRow::into_model).collect()
        })
    }

    /// Attribute `referred_user_id` to the owner of the active `code`.
    /// Returns `None` when no active code matches.
    pub fn record_referral(&self, code: &str, referred_user_id: Uuid) -> Result<Option<ReferralRecord>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let referrer: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM referral_codes WHERE code = ?1 AND active = 1",
                    [code],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(referrer) = referrer else {
                return Ok(None);
            };
            let referrer_id = Uuid::parse_str(&referrer)?;
            if referrer_id == referred_user_id {
                bail!("user {} cannot refer themselves", referred_user_id);
            }

            let record = ReferralRecord {
                id: Uuid::new_v4(),
                referrer_id,
                referred_user_id,
                referral_code: code.to_string(),
                status: ReferralStatus::Pending,
                earnings_total: 0.0,
                created_at: now(),
            };
            tx.execute(
                "INSERT INTO referrals (id, referrer_id, referred_user_id, referral_code, status, earnings_total, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.to_string(),
                    referrer,
                    referred_user_id.to_string(),
                    code,
                    record.status.as_str(),
                    record.earnings_total,
                    fmt_ts(&record.created_at),
                ],
            )?;

            tx.commit()?;
            Ok(Some(record))
        })
    }

    pub fn update_referral(
        &self,
        id: Uuid,
        status: ReferralStatus,
        earnings_total: f64,
    ) -> Result<Option<Change<ReferralRecord>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(old) = query_referral(&tx, id)? else {
                return Ok(None);
            };
            tx.execute(
                "UPDATE referrals SET status = ?2, earnings_total = ?3 WHERE id = ?1",
                params![id.to_string(), status.as_str(), earnings_total],
            )?;
            let new = ReferralRecord {
                status,
                earnings_total,
                ..old.clone()
            };

            tx.commit()?;
            Ok(Some(Change { old: Some(old), new }))
        })
    }

    pub fn record_auto_share(&self, user_id: Uuid, amount: f64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO auto_share_earnings (id, user_id, amount, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![Uuid::new_v4().to_string(), user_id.to_string(), amount, fmt_ts(&now())],
            )?;
            Ok(())
        })
    }

    // -- Challenges --

    pub fn get_challenge_progress(&self, user_id: Uuid) -> Result<Vec<ChallengeProgress>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM challenge_progress WHERE user_id = ?1",
                PROGRESS_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id.to_string()], progress_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(ProgressRow::into_model).collect()
        })
    }

    pub fn get_challenge_progress_for(
        &self,
        user_id: Uuid,
        challenge_id: &str,
    ) -> Result<Option<ChallengeProgress>> {
        self.with_conn(|conn| query_progress(conn, user_id, challenge_id))
    }

    /// Upsert keyed by `(user_id, challenge_id)`. The row id of an existing
    /// row is kept.
    pub fn upsert_challenge_progress(
        &self,
        progress: &ChallengeProgress,
    ) -> Result<Change<ChallengeProgress>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let old = query_progress(&tx, progress.user_id, &progress.challenge_id)?;

            tx.execute(
                "INSERT INTO challenge_progress
                     (id, user_id, challenge_id, progress, target_value, status,
                      completion_date, reward_claimed, claim_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(user_id, challenge_id) DO UPDATE SET
                     progress = excluded.progress,
                     target_value = excluded.target_value,
                     status = excluded.status,
                     completion_date = excluded.completion_date,
                     reward_claimed = excluded.reward_claimed,
                     claim_date = excluded.claim_date",
                params![
                    progress.id.to_string(),
                    progress.user_id.to_string(),
                    progress.challenge_id,
                    progress.progress,
                    progress.target_value,
                    progress.status.as_str(),
                    progress.completion_date.as_ref().map(fmt_ts),
                    progress.reward_claimed,
                    progress.claim_date.as_ref().map(fmt_ts),
                ],
            )?;

            let new = ChallengeProgress {
                id: old.as_ref().map_or(progress.id, |o| o.id),
                ..progress.clone()
            };

            tx.commit()?;
            Ok(Change { old, new })
        })
    }

    /// Mark a completed, unclaimed challenge claimed and credit `points` as a
    /// completed `challenge_reward` transaction. `None` when there was
    /// nothing to claim.
    pub fn claim_challenge_reward(
        &self,
        user_id: Uuid,
        challenge_id: &str,
        points: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<Change<ChallengeProgress>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let Some(old) = query_progress(&tx, user_id, challenge_id)? else {
                return Ok(None);
            };
            let claimed = tx.execute(
                "UPDATE challenge_progress SET reward_claimed = 1, claim_date = ?3
                 WHERE user_id = ?1 AND challenge_id = ?2
                   AND reward_claimed = 0 AND status = 'completed'",
                params![user_id.to_string(), challenge_id, fmt_ts(&claimed_at)],
            )?;
            if claimed == 0 {
                return Ok(None);
            }

            insert_transaction(
                &tx,
                &EarningRecord {
                    id: Uuid::new_v4(),
                    user_id,
                    amount: points as f64,
                    kind: "challenge_reward".into(),
                    status: TransactionStatus::Completed,
                    created_at: claimed_at,
                },
            )?;

            let new = ChallengeProgress {
                reward_claimed: true,
                claim_date: Some(claimed_at),
                ..old.clone()
            };

            tx.commit()?;
            Ok(Some(Change { old: Some(old), new }))
        })
    }
}

fn code_row(row: &SqlRow<'_>) -> rusqlite::Result<CodeRow> {
    Ok(CodeRow {
        user_id: row.get(0)?,
        code: row.get(1)?,
        created_at: row.get(2)?,
    })
}

fn referral_row(row: &SqlRow<'_>) -> rusqlite::Result<ReferralRow> {
    Ok(ReferralRow {
        id: row.get(0)?,
        referrer_id: row.get(1)?,
        referred_user_id: row.get(2)?,
        referral_code: row.get(3)?,
        status: row.get(4)?,
        earnings_total: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn progress_row(row: &SqlRow<'_>) -> rusqlite::Result<ProgressRow> {
    Ok(ProgressRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        challenge_id: row.get(2)?,
        progress: row.get(3)?,
        target_value: row.get(4)?,
        status: row.get(5)?,
        completion_date: row.get(6)?,
        reward_claimed: row.get(7)?,
        claim_date: row.get(8)?,
    })
}

fn query_trust_score(conn: &Connection, user_id: Uuid) -> Result<Option<TrustScoreRow>> {
    let sql = format!("SELECT {} FROM trust_scores WHERE user_id = ?1", SCORE_COLUMNS);
    let row = conn
        .query_row(&sql, [user_id.to_string()], |row| {
            Ok(ScoreRow {
                user_id: row.get(0)?,
                score: row.get(1)?,
                updated_at: row.get(2)?,
            })
        })
        .optional()?;

    row.map(ScoreRow::into_model).transpose()
}

fn query_earnings_summary(conn: &Connection, user_id: Uuid) -> Result<Option<EarningsSummary>> {
    let sql = format!("SELECT {} FROM earnings_summaries WHERE user_id = ?1", SUMMARY_COLUMNS);
    let row = conn
        .query_row(&sql, [user_id.to_string()], |row| {
            Ok(SummaryRow {
                user_id: row.get(0)?,
                lifetime_earnings: row.get(1)?,
                current_level: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?;

    row.map(SummaryRow::into_model).transpose()
}

fn query_referral(conn: &Connection, id: Uuid) -> Result<Option<ReferralRecord>> {
    let sql = format!("SELECT {} FROM referrals WHERE id = ?1", REFERRAL_COLUMNS);
    let row = conn
        .query_row(&sql, [id.to_string()], referral_row)
        .optional()?;

    row.map(ReferralRow::into_model).transpose()
}

fn query_progress(
    conn: &Connection,
    user_id: Uuid,
    challenge_id: &str,
) -> Result<Option<ChallengeProgress>> {
    let sql = format!(
        "SELECT {} FROM challenge_progress WHERE user_id = ?1 AND challenge_id = ?2",
        PROGRESS_COLUMNS
    );
    let row = conn
        .query_row(&sql, params![user_id.to_string(), challenge_id], progress_row)
        .optional()?;

    row.map(ProgressRow::into_model).transpose()
}

fn insert_transaction(conn: &Connection, record: &EarningRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO transactions (id, user_id, amount, kind, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            record.id.to_string(),
            record.user_id.to_string(),
            record.amount,
            record.kind,
            record.status.as_str(),
            fmt_ts(&record.created_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::models::ChallengeStatus;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn test_trust_change_applies_delta_to_stored_score() {
        let db = db();
        let user = Uuid::new_v4();
        let meta = serde_json::json!({ "source": "test" });

        let (change, entry) = db.record_trust_change(user, 5, "kyc", Some(&meta)).unwrap();
        assert!(change.old.is_none());
        assert_eq!(change.new.score, 55);
        assert_eq!((entry.old_score, entry.new_score), (50, 55));

        let (change, entry) = db.record_trust_change(user, 5, "email", None).unwrap();
        assert_eq!(change.old.unwrap().score, 55);
        assert_eq!((entry.old_score, entry.new_score), (55, 60));

        // Clamped inside the transaction
        let (_, entry) = db.record_trust_change(user, 200, "bonus", None).unwrap();
        assert_eq!((entry.old_score, entry.new_score), (60, 100));

        assert_eq!(db.get_trust_score(user).unwrap().unwrap().score, 100);
        let history = db.get_trust_history(user, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].reason, "bonus");
        assert_eq!(history[2].metadata.as_ref().unwrap()["source"], "test");
        // Every entry starts where the previous one ended
        assert_eq!(history[0].old_score, history[1].new_score);
        assert_eq!(history[1].old_score, history[2].new_score);
        assert_eq!(db.get_trust_history(user, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_rows_are_none() {
        let db = db();
        let user = Uuid::new_v4();
        assert!(db.get_trust_score(user).unwrap().is_none());
        assert!(db.get_earnings_summary(user).unwrap().is_none());
        assert!(db.get_referral_code(user).unwrap().is_none());
        assert!(db.get_challenge_progress_for(user, "first-sale").unwrap().is_none());
        assert_eq!(db.referral_aggregate(user, now()).unwrap(), ReferralAggregate::default());
    }

    #[test]
    fn test_lifetime_earnings_sets_level() {
        let db = db();
        let user = Uuid::new_v4();

        let change = db.set_lifetime_earnings(user, 2_500.0).unwrap();
        assert!(change.old.is_none());
        assert_eq!(change.new.current_level, Some(4));

        let change = db.set_lifetime_earnings(user, 12_000.0).unwrap();
        assert_eq!(change.old.unwrap().current_level, Some(4));
        assert_eq!(change.new.current_level, Some(5));

        assert!(db.set_lifetime_earnings(user, -1.0).is_err());
    }

    #[test]
    fn test_completed_earnings_window() {
        let db = db();
        let user = Uuid::new_v4();
        let since = now();

        db.record_transaction(user, 20.0, "sale", TransactionStatus::Completed).unwrap();
        db.record_transaction(user, 99.0, "sale", TransactionStatus::Pending).unwrap();
        db.record_transaction(Uuid::new_v4(), 5.0, "sale", TransactionStatus::Completed).unwrap();

        let recent = db.get_completed_earnings_since(user, since).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].amount, 20.0);

        let later = now() + chrono::Duration::seconds(1);
        assert!(db.get_completed_earnings_since(user, later).unwrap().is_empty());
    }

    #[test]
    fn test_code_rotation_is_idempotent() {
        let db = db();
        let user = Uuid::new_v4();
        let key = Uuid::new_v4();

        let (first, created) = db.rotate_referral_code(user, key, "AAAA2222").unwrap();
        assert!(created);
        let (again, created) = db.rotate_referral_code(user, key, "BBBB3333").unwrap();
        assert!(!created);
        assert_eq!(again.code, first.code);
        assert_eq!(db.get_referral_code(user).unwrap().unwrap().code, "AAAA2222");

        let (next, _) = db.rotate_referral_code(user, Uuid::new_v4(), "CCCC4444").unwrap();
        assert_eq!(next.code, "CCCC4444");
        assert_eq!(db.get_referral_code(user).unwrap().unwrap().code, "CCCC4444");

        // Someone else's key is refused
        assert!(db.rotate_referral_code(Uuid::new_v4(), key, "DDDD5555").is_err());
    }

    #[test]
    fn test_referrals_and_aggregate() {
        let db = db();
        let referrer = Uuid::new_v4();
        db.rotate_referral_code(referrer, Uuid::new_v4(), "REFR2345").unwrap();

        assert!(db.record_referral("NOPE2345", Uuid::new_v4()).unwrap().is_none());
        assert!(db.record_referral("REFR2345", referrer).is_err());

        let first = db.record_referral("REFR2345", Uuid::new_v4()).unwrap().unwrap();
        let second = db.record_referral("REFR2345", Uuid::new_v4()).unwrap().unwrap();
        // One referral per referred user
        assert!(db.record_referral("REFR2345", second.referred_user_id).is_err());

        let change = db
            .update_referral(first.id, ReferralStatus::Active, 40.0)
            .unwrap()
            .unwrap();
        assert_eq!(change.old.unwrap().status, ReferralStatus::Pending);
        assert!(db.update_referral(Uuid::new_v4(), ReferralStatus::Active, 1.0).unwrap().is_none());

        db.record_auto_share(referrer, 0.2).unwrap();
        db.record_auto_share(referrer, 0.3).unwrap();

        let agg = db.referral_aggregate(referrer, now() - chrono::Duration::days(1)).unwrap();
        assert_eq!(agg.total_referrals, 2);
        assert_eq!(agg.active_referrals, 1);
        assert_eq!(agg.total_earnings, 40.0);
        assert_eq!(agg.earnings_this_month, 40.0);
        assert!((agg.total_auto_shared - 0.5).abs() < 1e-9);

        let page = db.get_referrals(referrer, 0, 1).unwrap();
        assert_eq!(page[0].id, second.id);
        let page = db.get_referrals(referrer, 1, 10).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, first.id);
    }

    fn progress(user_id: Uuid, value: i64, status: ChallengeStatus) -> ChallengeProgress {
        ChallengeProgress {
            id: Uuid::new_v4(),
            user_id,
            challenge_id: "weekly-creator".into(),
            progress: value,
            target_value: 5,
            status,
            completion_date: (status == ChallengeStatus::Completed).then(now),
            reward_claimed: false,
            claim_date: None,
        }
    }

    #[test]
    fn test_progress_upsert_keeps_row_id() {
        let db = db();
        let user = Uuid::new_v4();

        let first = db.upsert_challenge_progress(&progress(user, 2, ChallengeStatus::Active)).unwrap();
        assert!(first.old.is_none());
        let second = db.upsert_challenge_progress(&progress(user, 5, ChallengeStatus::Completed)).unwrap();
        assert_eq!(second.new.id, first.new.id);
        assert_eq!(second.old.unwrap().progress, 2);

        let stored = db.get_challenge_progress(user).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, first.new.id);
        assert_eq!(stored[0].status, ChallengeStatus::Completed);
    }

    #[test]
    fn test_claim_guard() {
        let db = db();
        let user = Uuid::new_v4();

        assert!(db.claim_challenge_reward(user, "weekly-creator", 200, now()).unwrap().is_none());

        db.upsert_challenge_progress(&progress(user, 3, ChallengeStatus::Active)).unwrap();
        assert!(db.claim_challenge_reward(user, "weekly-creator", 200, now()).unwrap().is_none());

        db.upsert_challenge_progress(&progress(user, 5, ChallengeStatus::Completed)).unwrap();
        let change = db.claim_challenge_reward(user, "weekly-creator", 200, now()).unwrap().unwrap();
        assert!(change.new.reward_claimed);
        assert!(db.claim_challenge_reward(user, "weekly-creator", 200, now()).unwrap().is_none());

        let credits = db
            .get_completed_earnings_since(user, now() - chrono::Duration::minutes(1))
            .unwrap();
        assert_eq!(credits.len(), 1);
        assert_eq!(credits[0].kind, "challenge_reward");
        assert_eq!(credits[0].amount, 200.0);
    }
}
