use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_types::api::Notification;
use tally_types::events::{ChangeEvent, ChangeKind, Collection, FeedFilter, Row};
use tally_types::models::{ReferralRecord, ReferralStats, ReferralStatus};
use tally_types::tables::TierInfo;

use crate::EngineContext;
use crate::error::{FeedError, TrackerError, absent_as_none};
use crate::feed::{ChangeHandler, Subscription, spawn_listener};
use crate::tracker::{Snapshot, Tracker, TrackerCore};

const CODE_LEN: usize = 8;

/// No 0/O or 1/I, so codes survive being read aloud.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralOverview {
    pub stats: ReferralStats,
    /// Loaded pages, newest first.
    pub referrals: Vec<ReferralRecord>,
    pub offset: usize,
    pub has_more: bool,
    pub referral_code: Option<String>,
    pub referral_link: Option<String>,
}

impl ReferralOverview {
    fn sync_has_more(&mut self) {
        self.has_more = has_more(self.offset, self.stats.total_referrals);
    }
}

pub fn has_more(offset: usize, total_referrals: u32) -> bool {
    offset < total_referrals as usize
}

pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn referral_link(base_url: &str, code: &str) -> String {
    format!("{}/signup?ref={}", base_url.trim_end_matches('/'), code)
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

/// Sponsored accounts, their aggregate earnings, and the referral tier.
pub struct ReferralTracker {
    ctx: EngineContext,
    core: TrackerCore<ReferralOverview>,
    /// Last version of every record seen, loaded or pushed. Patch deltas are
    /// computed against it so a redelivered event changes nothing. Only
    /// touched under the tracker's state lock.
    last_seen: SyncMutex<HashMap<Uuid, ReferralRecord>>,
    /// Idempotency key of a code rotation that has not succeeded yet.
    pending_code_key: Mutex<Option<Uuid>>,
}

impl ReferralTracker {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        let ttl = ctx.config.referral_ttl;
        Arc::new(Self {
            ctx,
            core: TrackerCore::new("referral", ttl),
            last_seen: SyncMutex::new(HashMap::new()),
            pending_code_key: Mutex::new(None),
        })
    }

    /// Stats, active code and the first page of referrals.
    pub async fn fetch(&self, skip_cache: bool) -> Option<ReferralOverview> {
        let store = &self.ctx.store;
        let user_id = self.ctx.user_id;
        let page_size = self.ctx.config.referral_page_size;
        let base_url = &self.ctx.config.referral_base_url;

        let source = || async move {
            let code = absent_as_none(store.referral_code(user_id).await)
                .map_err(TrackerError::fetch)?;
            let aggregate = store
                .referral_aggregate(user_id, month_start(Utc::now()))
                .await
                .map_err(TrackerError::fetch)?;
            let page = store
                .referrals(user_id, 0, page_size)
                .await
                .map_err(TrackerError::fetch)?;

            let mut overview = ReferralOverview {
                stats: ReferralStats::from_aggregate(&aggregate),
                offset: page.len(),
                referrals: page,
                has_more: false,
                referral_link: code.as_ref().map(|c| referral_link(base_url, &c.code)),
                referral_code: code.map(|c| c.code),
            };
            overview.sync_has_more();
            Ok::<_, TrackerError>(overview)
        };

        // Records are remembered under the same lock that publishes them
        let overview = self
            .core
            .load_with(skip_cache, source, |o| self.remember(&o.referrals))
            .await;

        if overview.is_none() {
            error!("Failed to load referrals for {}", user_id);
        }
        overview
    }

    fn seen(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ReferralRecord>> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, records: &[ReferralRecord]) {
        let mut seen = self.seen();
        for r in records {
            seen.insert(r.id, r.clone());
        }
    }

    /// Load the next page. Returns `true` when new records were appended.
    pub async fn load_more(&self) -> bool {
        let Some(offset) = self
            .core
            .read(|d| d.filter(|o| o.has_more).map(|o| o.offset))
            .await
        else {
            return false;
        };

        let limit = self.ctx.config.referral_page_size;
        let page = match self.ctx.store.referrals(self.ctx.user_id, offset, limit).await {
            Ok(page) => page,
            Err(e) => {
                error!("Failed to load referrals page at {} for {}: {}", offset, self.ctx.user_id, e);
                self.core.set_error(TrackerError::fetch(e)).await;
                return false;
            }
        };

        let fetched = page.len();
        let mut appended = 0;
        self.core
            .patch(|o| {
                self.remember(&page);
                for record in page {
                    if !o.referrals.iter().any(|r| r.id == record.id) {
                        o.referrals.push(record);
                        appended += 1;
                    }
                }
                o.offset += fetched;
                // A short page means the aggregate count ran ahead of the rows
                if fetched < limit {
                    o.has_more = false;
                } else {
                    o.sync_has_more();
                }
            })
            .await;
        debug!("Loaded {} referrals ({} new) at offset {}", fetched, appended, offset);
        appended > 0
    }

    /// Copy the active code to the clipboard. No state change.
    pub async fn copy_referral_code(&self) -> bool {
        let Some(code) = self.core.read(|d| d.and_then(|o| o.referral_code.clone())).await else {
            return false;
        };

        match self.ctx.clipboard.write_text(&code) {
            Ok(()) => {
                self.ctx.notifier.notify(Notification::info(
                    "Copied!",
                    "Referral code copied to clipboard",
                ));
                true
            }
            Err(e) => {
                warn!("Failed to copy referral code: {}", e);
                self.ctx.notifier.notify(Notification::destructive(
                    "Error",
                    "Could not copy referral code",
                ));
                false
            }
        }
    }

    /// Rotate to a fresh code. A retry after a failed attempt reuses the
    /// same idempotency key, so the store never ends up with two new codes.
    pub async fn generate_new_code(&self) -> bool {
        let _updating = self.core.begin_update();

        let key = *self
            .pending_code_key
            .lock()
            .await
            .get_or_insert_with(Uuid::new_v4);
        let candidate = generate_code();

        let code = match self
            .ctx
            .store
            .rotate_referral_code(self.ctx.user_id, key, &candidate)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                error!("Failed to generate referral code for {}: {}", self.ctx.user_id, e);
                self.core.set_error(TrackerError::write(&e)).await;
                self.ctx.notifier.notify(Notification::destructive(
                    "Error",
                    "Failed to generate a new referral code",
                ));
                return false;
            }
        };

        self.pending_code_key.lock().await.take();
        info!("New referral code for {}", self.ctx.user_id);

        let link = referral_link(&self.ctx.config.referral_base_url, &code.code);
        self.core
            .patch(|o| {
                o.referral_code = Some(code.code.clone());
                o.referral_link = Some(link);
            })
            .await;
        self.ctx.notifier.notify(Notification::info(
            "New referral code",
            format!("Your new referral code is {}", code.code),
        ));
        true
    }

    pub async fn tier_info(&self) -> Option<&'static TierInfo> {
        self.core.read(|d| d.map(|o| o.stats.tier_info())).await
    }

    pub async fn next_tier_info(&self) -> Option<&'static TierInfo> {
        self.core.read(|d| d.and_then(|o| o.stats.next_tier_info())).await
    }

    pub async fn progress_to_next_tier(&self) -> u32 {
        self.core
            .read(|d| d.map_or(0, |o| o.stats.progress_to_next_tier()))
            .await
    }

    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, TrackerError> {
        let filter = FeedFilter::new(Collection::Referrals, self.ctx.user_id);
        match self.ctx.feed.subscribe(filter).await {
            Ok(stream) => Ok(spawn_listener(filter, Arc::downgrade(self), stream)),
            Err(e) => {
                error!("Referral subscription failed for {}: {}", self.ctx.user_id, e);
                let err = TrackerError::subscription(e);
                self.core.set_error(err.clone()).await;
                Err(err)
            }
        }
    }

    async fn apply_insert(&self, record: ReferralRecord) {
        // Dedup and patch under one lock, so a load applying a page that
        // already holds this record cannot slip in between
        let fresh = self
            .core
            .update(|data| {
                let mut seen = self.seen();
                if seen.contains_key(&record.id) {
                    return false;
                }
                seen.insert(record.id, record.clone());

                if let Some(o) = data {
                    o.stats.total_referrals += 1;
                    if record.status == ReferralStatus::Active {
                        o.stats.active_referrals += 1;
                    }
                    o.stats.total_earnings += record.earnings_total;
                    o.stats.recompute();
                    // The new row shifts every stored page by one
                    o.offset += 1;
                    o.referrals.insert(0, record.clone());
                    o.sync_has_more();
                }
                true
            })
            .await;

        if !fresh {
            debug!("Referral {} already known, skipping insert", record.id);
            return;
        }

        self.ctx.notifier.notify(Notification::info(
            "New referral!",
            "Someone just joined using your referral code.",
        ));
    }

    async fn apply_update(&self, old: Option<ReferralRecord>, record: ReferralRecord) {
        self.core
            .update(|data| {
                let previous = {
                    let mut seen = self.seen();
                    let previous = seen.get(&record.id).cloned().or(old);
                    seen.insert(record.id, record.clone());
                    previous
                };

                let Some(o) = data else {
                    return;
                };
                if let Some(slot) = o.referrals.iter_mut().find(|r| r.id == record.id) {
                    *slot = record.clone();
                }

                let Some(prev) = previous else {
                    return;
                };
                match (prev.status, record.status) {
                    (ReferralStatus::Pending, ReferralStatus::Active) => o.stats.active_referrals += 1,
                    (ReferralStatus::Active, ReferralStatus::Pending) => {
                        o.stats.active_referrals = o.stats.active_referrals.saturating_sub(1)
                    }
                    _ => {}
                }
                let delta = record.earnings_total - prev.earnings_total;
                if delta != 0.0 {
                    o.stats.total_earnings += delta;
                }
                o.stats.recompute();
            })
            .await;
    }
}

#[async_trait]
impl Tracker for ReferralTracker {
    type Data = ReferralOverview;

    async fn snapshot(&self) -> Snapshot<ReferralOverview> {
        self.core.snapshot().await
    }

    async fn refresh(&self) {
        self.fetch(true).await;
    }
}

#[async_trait]
impl ChangeHandler for ReferralTracker {
    async fn on_change(&self, event: ChangeEvent) {
        let Row::Referral(record) = event.new else {
            return;
        };

        match event.event_type {
            ChangeKind::Insert => self.apply_insert(record).await,
            ChangeKind::Update => {
                let old = match event.old {
                    Some(Row::Referral(old)) => Some(old),
                    _ => None,
                };
                self.apply_update(old, record).await;
            }
        }
    }

    async fn on_feed_error(&self, err: FeedError) {
        error!("Referral feed failed for {}: {}", self.ctx.user_id, err);
        self.core.invalidate().await;
        self.core.set_error(TrackerError::subscription(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tally_types::models::ReferralTier;

    use crate::mock::{Harness, referral, settle};

    #[test]
    fn test_has_more_boundaries() {
        assert!(!has_more(0, 0));
        assert!(has_more(0, 1));
        assert!(has_more(9, 10));
        assert!(!has_more(10, 10));
        assert!(!has_more(12, 10));
    }

    #[test]
    fn test_generated_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
        assert_eq!(
            referral_link("https://tally.test/", "ABCD2345"),
            "https://tally.test/signup?ref=ABCD2345"
        );
    }

    #[tokio::test]
    async fn test_fetch_with_no_referrals() {
        let h = Harness::new();
        h.store.set_auto_shared(h.user_id, 4.5);
        let tracker = ReferralTracker::new(h.context());

        let overview = tracker.fetch(false).await.unwrap();
        assert_eq!(overview.stats.total_referrals, 0);
        assert_eq!(overview.stats.total_auto_shared, 4.5);
        assert_eq!(overview.stats.tier, ReferralTier::Bronze);
        assert_eq!(overview.stats.conversion_rate, 0.0);
        assert!(!overview.has_more);
        assert!(overview.referral_code.is_none());
        assert_eq!(tracker.progress_to_next_tier().await, 0);
    }

    #[tokio::test]
    async fn test_insert_event_scenario_c() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        let record = referral(h.user_id, ReferralStatus::Pending, 0.0);
        tracker.on_change(ChangeEvent::insert(Row::Referral(record.clone()))).await;

        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.stats.active_referrals, 0);
        assert_eq!(o.stats.tier, ReferralTier::Bronze);
        assert_eq!(o.referrals[0].id, record.id);
        assert_eq!(o.offset, 1);

        let toasts = h.notifier.take();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].title, "New referral!");
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        let event = ChangeEvent::insert(Row::Referral(referral(h.user_id, ReferralStatus::Active, 12.5)));
        tracker.on_change(event.clone()).await;
        tracker.on_change(event).await;

        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.stats.active_referrals, 1);
        assert_eq!(o.stats.total_earnings, 12.5);
        assert_eq!(o.referrals.len(), 1);
        assert_eq!(h.notifier.take().len(), 1);
    }

    async fn reads_reach(h: &Harness, query: &str, n: usize) {
        while h.store.reads(query) < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_insert_during_refresh_is_counted_once() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        let gate = h.store.hold("referrals");
        let record = referral(h.user_id, ReferralStatus::Active, 7.0);
        let (refreshed, _) = tokio::join!(tracker.fetch(true), async {
            reads_reach(&h, "referrals", 2).await;
            // The refresh has already read the store without this row
            h.store.add_referral(record.clone());
            tracker.on_change(ChangeEvent::insert(Row::Referral(record.clone()))).await;
            gate.notify_one();
        });

        let o = refreshed.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.stats.total_earnings, 7.0);
        assert_eq!(o.referrals.len(), 1);

        // A redelivered insert changes nothing
        tracker.on_change(ChangeEvent::insert(Row::Referral(record))).await;
        assert_eq!(tracker.snapshot().await.data.unwrap().stats.total_referrals, 1);

        // The stale refresh was not cached
        let reads = h.store.reads("referral_aggregate");
        let o = tracker.fetch(false).await.unwrap();
        assert_eq!(h.store.reads("referral_aggregate"), reads + 1);
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.referrals.len(), 1);
        assert_eq!(h.notifier.take().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_during_first_load_is_counted_once() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());

        let gate = h.store.hold("referrals");
        let record = referral(h.user_id, ReferralStatus::Pending, 0.0);
        let (loaded, _) = tokio::join!(tracker.fetch(false), async {
            reads_reach(&h, "referrals", 1).await;
            h.store.add_referral(record.clone());
            tracker.on_change(ChangeEvent::insert(Row::Referral(record.clone()))).await;
            gate.notify_one();
        });

        // Nothing was shown to patch, so the load read the store again
        assert_eq!(h.store.reads("referrals"), 2);
        let o = loaded.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.referrals.len(), 1);

        tracker.on_change(ChangeEvent::insert(Row::Referral(record))).await;
        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.referrals.len(), 1);
        assert_eq!(h.notifier.take().len(), 1);
    }

    #[tokio::test]
    async fn test_update_applies_deltas_once() {
        let h = Harness::new();
        let record = referral(h.user_id, ReferralStatus::Pending, 10.0);
        h.store.add_referral(record.clone());
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        let updated = ReferralRecord {
            status: ReferralStatus::Active,
            earnings_total: 25.0,
            ..record.clone()
        };
        let event = ChangeEvent::update(Some(Row::Referral(record)), Row::Referral(updated));
        tracker.on_change(event.clone()).await;
        tracker.on_change(event).await;

        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.active_referrals, 1);
        assert_eq!(o.stats.total_earnings, 25.0);
        assert_eq!(o.stats.conversion_rate, 1.0);
        assert_eq!(o.referrals[0].status, ReferralStatus::Active);
        // Updates are silent
        assert!(h.notifier.take().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_recomputes_from_store() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        // Optimistic patch for a row the store never saw
        let phantom = referral(h.user_id, ReferralStatus::Active, 99.0);
        tracker.on_change(ChangeEvent::insert(Row::Referral(phantom))).await;
        assert_eq!(tracker.snapshot().await.data.unwrap().stats.total_referrals, 1);

        tracker.refresh().await;
        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.total_referrals, 0);
        assert!(o.referrals.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());

        tracker.fetch(false).await;
        tokio::time::advance(Duration::from_secs(29)).await;
        tracker.fetch(false).await;
        assert_eq!(h.store.reads("referral_aggregate"), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.fetch(false).await;
        assert_eq!(h.store.reads("referral_aggregate"), 2);
    }

    #[tokio::test]
    async fn test_load_more_pages_until_exhausted() {
        let h = Harness::new();
        for _ in 0..25 {
            h.store.add_referral(referral(h.user_id, ReferralStatus::Active, 1.0));
        }
        let tracker = ReferralTracker::new(h.context());

        let o = tracker.fetch(false).await.unwrap();
        assert_eq!(o.referrals.len(), 10);
        assert_eq!(o.stats.tier, ReferralTier::Gold);
        assert!(o.has_more);

        assert!(tracker.load_more().await);
        assert!(tracker.load_more().await);
        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.referrals.len(), 25);
        assert_eq!(o.offset, 25);
        assert!(!o.has_more);

        assert!(!tracker.load_more().await);
    }

    #[tokio::test]
    async fn test_copy_referral_code() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;
        assert!(!tracker.copy_referral_code().await);

        h.store.set_referral_code(h.user_id, "TALLY234");
        tracker.refresh().await;
        assert!(tracker.copy_referral_code().await);
        assert_eq!(h.clipboard.contents().as_deref(), Some("TALLY234"));

        h.clipboard.fail(true);
        assert!(!tracker.copy_referral_code().await);
        let toasts = h.notifier.take();
        assert_eq!(toasts.last().unwrap().title, "Error");
    }

    #[tokio::test]
    async fn test_generate_new_code_retry_is_idempotent() {
        let h = Harness::new();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;

        // The write lands but the response is lost
        h.store.fail_after_commit(true);
        assert!(!tracker.generate_new_code().await);
        h.store.fail_after_commit(false);

        assert!(tracker.generate_new_code().await);
        assert_eq!(h.store.issued_codes(h.user_id), 1);

        let o = tracker.snapshot().await.data.unwrap();
        let code = o.referral_code.unwrap();
        assert_eq!(o.referral_link.unwrap(), format!("https://app.example.com/signup?ref={}", code));

        // A fresh rotation gets a fresh key
        assert!(tracker.generate_new_code().await);
        assert_eq!(h.store.issued_codes(h.user_id), 2);
    }

    #[tokio::test]
    async fn test_live_insert_through_store() {
        let h = Harness::with_feed();
        let tracker = ReferralTracker::new(h.context());
        tracker.fetch(false).await;
        let _sub = tracker.subscribe().await.unwrap();

        // Someone else's referral
        h.store.add_referral(referral(uuid::Uuid::new_v4(), ReferralStatus::Active, 5.0));
        h.store.add_referral(referral(h.user_id, ReferralStatus::Active, 5.0));
        settle().await;

        let o = tracker.snapshot().await.data.unwrap();
        assert_eq!(o.stats.total_referrals, 1);
        assert_eq!(o.stats.active_referrals, 1);
        assert_eq!(o.stats.total_earnings, 5.0);
        assert_eq!(h.notifier.take().len(), 1);
    }
}
