use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS trust_scores (
            user_id     TEXT PRIMARY KEY,
            score       INTEGER NOT NULL CHECK (score BETWEEN 0 AND 100),
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trust_history (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            old_score   INTEGER NOT NULL,
            new_score   INTEGER NOT NULL,
            reason      TEXT NOT NULL,
            metadata    TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_trust_history_user
            ON trust_history(user_id, created_at);

        CREATE TABLE IF NOT EXISTS earnings_summaries (
            user_id            TEXT PRIMARY KEY,
            lifetime_earnings  REAL NOT NULL DEFAULT 0,
            current_level      INTEGER,
            updated_at         TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            amount      REAL NOT NULL,
            kind        TEXT NOT NULL,
            status      TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_transactions_user
            ON transactions(user_id, created_at);

        CREATE TABLE IF NOT EXISTS referral_codes (
            id           TEXT PRIMARY KEY,
            user_id      TEXT NOT NULL,
            code         TEXT NOT NULL UNIQUE,
            request_key  TEXT NOT NULL UNIQUE,
            active       INTEGER NOT NULL DEFAULT 1,
            created_at   TEXT NOT NULL
        );

        -- At most one active code per user
        CREATE UNIQUE INDEX IF NOT EXISTS idx_referral_codes_active
            ON referral_codes(user_id) WHERE active = 1;

        CREATE TABLE IF NOT EXISTS referrals (
            id                TEXT PRIMARY KEY,
            referrer_id       TEXT NOT NULL,
            referred_user_id  TEXT NOT NULL UNIQUE,
            referral_code     TEXT NOT NULL,
            status            TEXT NOT NULL CHECK (status IN ('pending', 'active')),
            earnings_total    REAL NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_referrals_referrer
            ON referrals(referrer_id, created_at);

        -- Written by the revenue-sharing service
        CREATE TABLE IF NOT EXISTS auto_share_earnings (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            amount      REAL NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_auto_share_user
            ON auto_share_earnings(user_id);

        CREATE TABLE IF NOT EXISTS challenge_progress (
            id               TEXT PRIMARY KEY,
            user_id          TEXT NOT NULL,
            challenge_id     TEXT NOT NULL,
            progress         INTEGER NOT NULL,
            target_value     INTEGER NOT NULL,
            status           TEXT NOT NULL CHECK (status IN ('active', 'completed')),
            completion_date  TEXT,
            reward_claimed   INTEGER NOT NULL DEFAULT 0,
            claim_date       TEXT,
            UNIQUE(user_id, challenge_id)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
