//! In-memory doubles for the store, the change feed, and the notification
//! surfaces. The store can be linked to a feed so that every write publishes
//! the matching change event, the way the SQLite store does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use tally_types::api::Notification;
use tally_types::events::{ChangeEvent, FeedFilter, Row};
use tally_types::models::{
    ChallengeProgress, ChallengeStatus, DEFAULT_TRUST_SCORE, EarningRecord, EarningsSummary,
    ReferralAggregate, ReferralCode, ReferralRecord, ReferralStatus, TransactionStatus,
    TrustHistoryEntry, TrustScoreRow, clamp_trust_score,
};

use crate::config::EngineConfig;
use crate::error::{ClipboardError, FeedError, StoreError};
use crate::feed::{ChangeFeed, FeedStream, broadcast_stream};
use crate::notify::{Clipboard, Notifier};
use crate::store::RewardsStore;
use crate::EngineContext;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// -- Feed --

pub struct MockFeed {
    tx: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
}

impl MockFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub fn publish(&self, event: ChangeEvent) {
        if let Some(tx) = lock(&self.tx).as_ref() {
            // No receivers is fine
            let _ = tx.send(event);
        }
    }

    /// Drop the sender; every live stream reports `FeedError::Closed`.
    pub fn close(&self) {
        lock(&self.tx).take();
    }
}

impl Default for MockFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for MockFeed {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, FeedError> {
        match lock(&self.tx).as_ref() {
            Some(tx) => Ok(broadcast_stream(tx.subscribe(), filter)),
            None => Err(FeedError::Closed),
        }
    }
}

// -- Store --

#[derive(Default)]
struct Tables {
    trust: HashMap<Uuid, TrustScoreRow>,
    /// Oldest first.
    history: HashMap<Uuid, Vec<TrustHistoryEntry>>,
    earnings: HashMap<Uuid, EarningsSummary>,
    transactions: Vec<EarningRecord>,
    codes: HashMap<Uuid, ReferralCode>,
    rotations: HashMap<(Uuid, Uuid), ReferralCode>,
    /// Oldest first.
    referrals: Vec<ReferralRecord>,
    auto_shared: HashMap<Uuid, f64>,
    challenges: Vec<ChallengeProgress>,
}

#[derive(Default)]
pub struct MockStore {
    tables: Mutex<Tables>,
    reads: Mutex<HashMap<&'static str, usize>>,
    holds: Mutex<HashMap<&'static str, Arc<Notify>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_after_commit: AtomicBool,
    feed: Option<Arc<MockFeed>>,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a change event on `feed` for every write.
    pub fn linked(feed: Arc<MockFeed>) -> Self {
        Self {
            feed: Some(feed),
            ..Self::default()
        }
    }

    fn publish(&self, event: ChangeEvent) {
        if let Some(feed) = &self.feed {
            feed.publish(event);
        }
    }

    fn read(&self, query: &'static str) -> Result<(), StoreError> {
        *lock(&self.reads).entry(query).or_default() += 1;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read failed".into()));
        }
        Ok(())
    }

    /// Released by a `hold` on `query`, if one is set. Runs after the read
    /// has taken its rows, so the caller holds a snapshot from before the wait.
    async fn gate(&self, query: &'static str) {
        let gate = lock(&self.holds).remove(query);
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write failed".into()));
        }
        Ok(())
    }

    fn committed(&self) -> Result<(), StoreError> {
        if self.fail_after_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection reset after commit".into()));
        }
        Ok(())
    }

    pub fn reads(&self, query: &str) -> usize {
        lock(&self.reads).get(query).copied().unwrap_or(0)
    }

    /// Park the next `query` read until the returned handle is notified.
    pub fn hold(&self, query: &'static str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.holds).insert(query, gate.clone());
        gate
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes land but report a failure, like a response lost in transit.
    pub fn fail_after_commit(&self, fail: bool) {
        self.fail_after_commit.store(fail, Ordering::SeqCst);
    }

    pub fn set_trust_score(&self, user_id: Uuid, score: i32) {
        lock(&self.tables).trust.insert(
            user_id,
            TrustScoreRow {
                user_id,
                score,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn trust_history_len(&self, user_id: Uuid) -> usize {
        lock(&self.tables).history.get(&user_id).map_or(0, Vec::len)
    }

    pub fn set_earnings(&self, summary: EarningsSummary) {
        let old = lock(&self.tables).earnings.insert(summary.user_id, summary.clone());
        self.publish(match old {
            Some(old) => ChangeEvent::update(Some(Row::EarningsSummary(old)), Row::EarningsSummary(summary)),
            None => ChangeEvent::insert(Row::EarningsSummary(summary)),
        });
    }

    pub fn add_transaction(
        &self,
        user_id: Uuid,
        amount: f64,
        status: TransactionStatus,
        created_at: DateTime<Utc>,
    ) {
        lock(&self.tables).transactions.push(EarningRecord {
            id: Uuid::new_v4(),
            user_id,
            amount,
            kind: "sale".into(),
            status,
            created_at,
        });
    }

    pub fn add_referral(&self, record: ReferralRecord) {
        lock(&self.tables).referrals.push(record.clone());
        self.publish(ChangeEvent::insert(Row::Referral(record)));
    }

    pub fn set_referral_code(&self, user_id: Uuid, code: &str) {
        lock(&self.tables).codes.insert(
            user_id,
            ReferralCode {
                user_id,
                code: code.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn set_auto_shared(&self, user_id: Uuid, amount: f64) {
        lock(&self.tables).auto_shared.insert(user_id, amount);
    }

    /// Number of distinct rotations that produced a code.
    pub fn issued_codes(&self, user_id: Uuid) -> usize {
        lock(&self.tables)
            .rotations
            .keys()
            .filter(|(user, _)| *user == user_id)
            .count()
    }

    pub fn challenge_row(&self, user_id: Uuid, challenge_id: &str) -> Option<ChallengeProgress> {
        lock(&self.tables)
            .challenges
            .iter()
            .find(|p| p.user_id == user_id && p.challenge_id == challenge_id)
            .cloned()
    }

    /// Amounts credited for claimed challenge rewards.
    pub fn reward_credits(&self, user_id: Uuid) -> Vec<f64> {
        lock(&self.tables)
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id && t.kind == "challenge_reward")
            .map(|t| t.amount)
            .collect()
    }
}

#[async_trait]
impl RewardsStore for MockStore {
    async fn trust_score(&self, user_id: Uuid) -> Result<Option<TrustScoreRow>, StoreError> {
        self.read("trust_score")?;
        Ok(lock(&self.tables).trust.get(&user_id).cloned())
    }

    async fn trust_history(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<TrustHistoryEntry>, StoreError> {
        self.read("trust_history")?;
        Ok(lock(&self.tables)
            .history
            .get(&user_id)
            .map(|h| h.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn record_trust_change(
        &self,
        user_id: Uuid,
        delta: i32,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<TrustHistoryEntry, StoreError> {
        self.write()?;
        let (entry, old, row) = {
            let mut tables = lock(&self.tables);
            let old = tables.trust.get(&user_id).cloned();
            let old_score = old.as_ref().map_or(DEFAULT_TRUST_SCORE, |r| r.score);
            let entry = TrustHistoryEntry {
                old_score,
                new_score: clamp_trust_score(i64::from(old_score) + i64::from(delta)),
                reason: reason.to_string(),
                metadata,
                timestamp: Utc::now(),
            };
            let row = TrustScoreRow {
                user_id,
                score: entry.new_score,
                updated_at: Utc::now(),
            };
            tables.history.entry(user_id).or_default().push(entry.clone());
            tables.trust.insert(user_id, row.clone());
            (entry, old, row)
        };
        self.publish(match old {
            Some(old) => ChangeEvent::update(Some(Row::TrustScore(old)), Row::TrustScore(row)),
            None => ChangeEvent::insert(Row::TrustScore(row)),
        });
        self.committed()?;
        Ok(entry)
    }

    async fn earnings_summary(&self, user_id: Uuid) -> Result<Option<EarningsSummary>, StoreError> {
        self.read("earnings_summary")?;
        Ok(lock(&self.tables).earnings.get(&user_id).cloned())
    }

    async fn completed_earnings_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<EarningRecord>, StoreError> {
        self.read("completed_earnings_since")?;
        Ok(lock(&self.tables)
            .transactions
            .iter()
            .filter(|t| {
                t.user_id == user_id
                    && t.status == TransactionStatus::Completed
                    && t.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn referral_code(&self, user_id: Uuid) -> Result<Option<ReferralCode>, StoreError> {
        self.read("referral_code")?;
        Ok(lock(&self.tables).codes.get(&user_id).cloned())
    }

    async fn rotate_referral_code(
        &self,
        user_id: Uuid,
        request_key: Uuid,
        code: &str,
    ) -> Result<ReferralCode, StoreError> {
        self.write()?;
        let issued = {
            let mut tables = lock(&self.tables);
            match tables.rotations.get(&(user_id, request_key)).cloned() {
                Some(existing) => existing,
                None => {
                    let issued = ReferralCode {
                        user_id,
                        code: code.to_string(),
                        created_at: Utc::now(),
                    };
                    tables.rotations.insert((user_id, request_key), issued.clone());
                    tables.codes.insert(user_id, issued.clone());
                    issued
                }
            }
        };
        self.committed()?;
        Ok(issued)
    }

    async fn referral_aggregate(
        &self,
        referrer_id: Uuid,
        month_start: DateTime<Utc>,
    ) -> Result<ReferralAggregate, StoreError> {
        self.read("referral_aggregate")?;
        let tables = lock(&self.tables);
        let mut agg = ReferralAggregate {
            total_auto_shared: tables.auto_shared.get(&referrer_id).copied().unwrap_or(0.0),
            ..ReferralAggregate::default()
        };
        for r in tables.referrals.iter().filter(|r| r.referrer_id == referrer_id) {
            agg.total_referrals += 1;
            if r.status == ReferralStatus::Active {
                agg.active_referrals += 1;
            }
            agg.total_earnings += r.earnings_total;
            if r.created_at >= month_start {
                agg.earnings_this_month += r.earnings_total;
            }
        }
        Ok(agg)
    }

    async fn referrals(
        &self,
        referrer_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ReferralRecord>, StoreError> {
        self.read("referrals")?;
        let page = lock(&self.tables)
            .referrals
            .iter()
            .rev()
            .filter(|r| r.referrer_id == referrer_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();
        self.gate("referrals").await;
        Ok(page)
    }

    async fn challenge_progress(&self, user_id: Uuid) -> Result<Vec<ChallengeProgress>, StoreError> {
        self.read("challenge_progress")?;
        Ok(lock(&self.tables)
            .challenges
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn challenge_progress_for(
        &self,
        user_id: Uuid,
        challenge_id: &str,
    ) -> Result<Option<ChallengeProgress>, StoreError> {
        self.read("challenge_progress_for")?;
        Ok(self.challenge_row(user_id, challenge_id))
    }

    async fn upsert_challenge_progress(&self, progress: &ChallengeProgress) -> Result<(), StoreError> {
        self.write()?;
        let old = {
            let mut guard = lock(&self.tables);
            let tables = &mut *guard;
            let slot = tables
                .challenges
                .iter_mut()
                .find(|p| p.user_id == progress.user_id && p.challenge_id == progress.challenge_id);
            match slot {
                Some(slot) => Some(std::mem::replace(slot, progress.clone())),
                None => {
                    tables.challenges.push(progress.clone());
                    None
                }
            }
        };
        let new = Row::ChallengeProgress(progress.clone());
        self.publish(match old {
            Some(old) => ChangeEvent::update(Some(Row::ChallengeProgress(old)), new),
            None => ChangeEvent::insert(new),
        });
        self.committed()
    }

    async fn claim_challenge_reward(
        &self,
        user_id: Uuid,
        challenge_id: &str,
        points: i64,
        claimed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.write()?;
        let change = {
            let mut guard = lock(&self.tables);
            let tables = &mut *guard;
            let Some(row) = tables
                .challenges
                .iter_mut()
                .find(|p| p.user_id == user_id && p.challenge_id == challenge_id)
            else {
                return Ok(false);
            };
            if row.status != ChallengeStatus::Completed || row.reward_claimed {
                return Ok(false);
            }

            let old = row.clone();
            row.reward_claimed = true;
            row.claim_date = Some(claimed_at);
            let new = row.clone();

            tables.transactions.push(EarningRecord {
                id: Uuid::new_v4(),
                user_id,
                amount: points as f64,
                kind: "challenge_reward".into(),
                status: TransactionStatus::Completed,
                created_at: claimed_at,
            });
            ChangeEvent::update(Some(Row::ChallengeProgress(old)), Row::ChallengeProgress(new))
        };
        self.publish(change);
        Ok(true)
    }
}

// -- Notification surfaces --

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    /// Everything notified since the last call.
    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *lock(&self.sent))
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        lock(&self.sent).push(notification);
    }
}

#[derive(Default)]
pub struct RecordingClipboard {
    text: Mutex<Option<String>>,
    fail: AtomicBool,
}

impl RecordingClipboard {
    pub fn contents(&self) -> Option<String> {
        lock(&self.text).clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Clipboard for RecordingClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClipboardError("permission denied".into()));
        }
        *lock(&self.text) = Some(text.to_string());
        Ok(())
    }
}

// -- Harness --

/// One user's worth of doubles, wired together.
pub struct Harness {
    pub user_id: Uuid,
    pub store: Arc<MockStore>,
    pub feed: Arc<MockFeed>,
    pub notifier: Arc<RecordingNotifier>,
    pub clipboard: Arc<RecordingClipboard>,
}

impl Harness {
    /// Store writes are not published.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Store writes are published on `feed`.
    pub fn with_feed() -> Self {
        Self::build(true)
    }

    fn build(linked: bool) -> Self {
        let feed = Arc::new(MockFeed::new());
        let store = if linked {
            MockStore::linked(feed.clone())
        } else {
            MockStore::new()
        };
        Self {
            user_id: Uuid::new_v4(),
            store: Arc::new(store),
            feed,
            notifier: Arc::new(RecordingNotifier::default()),
            clipboard: Arc::new(RecordingClipboard::default()),
        }
    }

    pub fn context(&self) -> EngineContext {
        self.context_for(self.user_id)
    }

    pub fn context_for(&self, user_id: Uuid) -> EngineContext {
        EngineContext {
            user_id,
            store: self.store.clone(),
            feed: self.feed.clone(),
            notifier: self.notifier.clone(),
            clipboard: self.clipboard.clone(),
            config: EngineConfig::default(),
        }
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn referral(referrer_id: Uuid, status: ReferralStatus, earnings_total: f64) -> ReferralRecord {
    ReferralRecord {
        id: Uuid::new_v4(),
        referrer_id,
        referred_user_id: Uuid::new_v4(),
        referral_code: "TESTCODE".into(),
        status,
        earnings_total,
        created_at: Utc::now(),
    }
}

/// Let spawned listener tasks drain whatever the feed has delivered.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
