use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use tally_types::api::Notification;
use tally_types::events::{ChangeEvent, Collection, FeedFilter, Row};
use tally_types::models::{DEFAULT_TRUST_SCORE, TrustHistoryEntry, TrustLevel, TrustScore};

use crate::EngineContext;
use crate::error::{FeedError, TrackerError, absent_as_none};
use crate::feed::{ChangeHandler, Subscription, spawn_listener};
use crate::tracker::{Snapshot, Tracker, TrackerCore};

/// Bounded reputation score, its history, and the action gate built on it.
pub struct TrustTracker {
    ctx: EngineContext,
    core: TrackerCore<TrustScore>,
    /// `updated_at` of the newest score row seen on the feed.
    feed_watermark: Mutex<Option<DateTime<Utc>>>,
}

impl TrustTracker {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        let ttl = ctx.config.trust_ttl;
        Arc::new(Self {
            ctx,
            core: TrackerCore::new("trust", ttl),
            feed_watermark: Mutex::new(None),
        })
    }

    /// Cached for the trust TTL unless `skip_cache`. A user without a score
    /// record gets the default score and an empty history.
    pub async fn fetch(&self, skip_cache: bool) -> Option<TrustScore> {
        let store = &self.ctx.store;
        let user_id = self.ctx.user_id;
        let limit = self.ctx.config.history_limit;
        let window = self.ctx.config.trend_window;

        self.core
            .load(skip_cache, || async move {
                let row = absent_as_none(store.trust_score(user_id).await).map_err(|e| {
                    error!("Failed to load trust score for {}: {}", user_id, e);
                    TrackerError::fetch(e)
                })?;
                let history = store.trust_history(user_id, limit).await.map_err(|e| {
                    error!("Failed to load trust history for {}: {}", user_id, e);
                    TrackerError::fetch(e)
                })?;

                let score = row.map_or(DEFAULT_TRUST_SCORE, |r| r.score);
                Ok(TrustScore::from_parts(score, history, window))
            })
            .await
    }

    /// Apply `delta` to the stored score, clamped to `[0, 100]`, and record
    /// why. The store applies the delta to its own current value, never to
    /// this tracker's snapshot. On failure nothing changes and `false` is
    /// returned.
    pub async fn update_score(
        &self,
        delta: i32,
        reason: &str,
        metadata: Option<serde_json::Value>,
    ) -> bool {
        let _updating = self.core.begin_update();

        let entry = match self
            .ctx
            .store
            .record_trust_change(self.ctx.user_id, delta, reason, metadata)
            .await
        {
            Ok(entry) => entry,
            Err(e) => {
                error!("Failed to update trust score for {}: {}", self.ctx.user_id, e);
                self.core.set_error(TrackerError::write(&e)).await;
                self.ctx.notifier.notify(Notification::destructive(
                    "Error",
                    "Failed to update trust score",
                ));
                return false;
            }
        };

        info!(
            "Trust score for {}: {} -> {} ({})",
            self.ctx.user_id, entry.old_score, entry.new_score, reason
        );

        self.core.invalidate().await;
        self.fetch(true).await;
        true
    }

    pub fn trust_level(score: i32) -> TrustLevel {
        TrustLevel::from_score(score)
    }

    /// `false` until a score has been loaded.
    pub async fn can_perform_action(&self, required_score: i32) -> bool {
        self.core
            .read(|d| d.is_some_and(|t| t.current_score >= required_score))
            .await
    }

    /// On-demand history read, newest first. Never served from cache.
    pub async fn history(&self, limit: Option<usize>) -> Vec<TrustHistoryEntry> {
        let limit = limit.unwrap_or(self.ctx.config.history_limit);
        match self.ctx.store.trust_history(self.ctx.user_id, limit).await {
            Ok(history) => history,
            Err(e) => {
                error!("Failed to load trust history for {}: {}", self.ctx.user_id, e);
                self.core.set_error(TrackerError::fetch(e)).await;
                Vec::new()
            }
        }
    }

    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, TrackerError> {
        let filter = FeedFilter::new(Collection::TrustScores, self.ctx.user_id);
        match self.ctx.feed.subscribe(filter).await {
            Ok(stream) => Ok(spawn_listener(filter, Arc::downgrade(self), stream)),
            Err(e) => {
                error!("Trust subscription failed for {}: {}", self.ctx.user_id, e);
                let err = TrackerError::subscription(e);
                self.core.set_error(err.clone()).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Tracker for TrustTracker {
    type Data = TrustScore;

    async fn snapshot(&self) -> Snapshot<TrustScore> {
        self.core.snapshot().await
    }

    async fn refresh(&self) {
        self.fetch(true).await;
    }
}

#[async_trait]
impl ChangeHandler for TrustTracker {
    async fn on_change(&self, event: ChangeEvent) {
        let Row::TrustScore(new) = &event.new else {
            return;
        };

        {
            let mut watermark = self.feed_watermark.lock().await;
            if watermark.is_some_and(|seen| new.updated_at <= seen) {
                debug!("Duplicate trust score event for {}", new.user_id);
                return;
            }
            *watermark = Some(new.updated_at);
        }

        let previous = match &event.old {
            Some(Row::TrustScore(old)) => Some(old.score),
            _ => self.core.read(|d| d.map(|t| t.current_score)).await,
        };

        if let Some(previous) = previous {
            let change = new.score - previous;
            if change != 0 {
                let (title, direction) = if change > 0 {
                    ("Trust score increased", "up")
                } else {
                    ("Trust score decreased", "down")
                };
                self.ctx.notifier.notify(Notification::info(
                    title,
                    format!(
                        "Your trust score went {} by {} points (now {}).",
                        direction,
                        change.abs(),
                        new.score
                    ),
                ));
            }
        }

        self.core.invalidate().await;
        self.fetch(true).await;
    }

    async fn on_feed_error(&self, err: FeedError) {
        error!("Trust feed failed for {}: {}", self.ctx.user_id, err);
        self.core.invalidate().await;
        self.core.set_error(TrackerError::subscription(err)).await;
    }
}
