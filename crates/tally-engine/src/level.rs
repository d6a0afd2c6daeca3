use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use tally_types::api::Notification;
use tally_types::events::{ChangeEvent, Collection, FeedFilter, Row};
use tally_types::models::{LevelProgression, TransactionStatus};
use tally_types::tables::{self, LevelThreshold};

use crate::EngineContext;
use crate::error::{FeedError, TrackerError, absent_as_none};
use crate::feed::{ChangeHandler, Subscription, spawn_listener};
use crate::tracker::{Snapshot, Tracker, TrackerCore};

/// Velocity assumed when nothing was earned in the trailing window.
const DEFAULT_DAILY_VELOCITY: f64 = 1.0;

/// Maps lifetime earnings onto the level table.
pub struct LevelTracker {
    ctx: EngineContext,
    core: TrackerCore<LevelProgression>,
    /// Highest level ever observed. Level-up toasts fire only above it.
    level_watermark: Mutex<Option<u32>>,
}

/// Level from the summary when it carries one, else from the table.
fn resolve_level(lifetime_earnings: f64, reported: Option<u32>) -> &'static LevelThreshold {
    reported
        .and_then(tables::level_info)
        .unwrap_or_else(|| tables::level_for_earnings(lifetime_earnings))
}

impl LevelTracker {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        let ttl = ctx.config.level_ttl;
        Arc::new(Self {
            ctx,
            core: TrackerCore::new("level", ttl),
            level_watermark: Mutex::new(None),
        })
    }

    pub async fn fetch(&self, skip_cache: bool) -> Option<LevelProgression> {
        let store = &self.ctx.store;
        let user_id = self.ctx.user_id;
        let window_days = self.ctx.config.velocity_window_days.max(1);

        let progression = self
            .core
            .load(skip_cache, || async move {
                let summary = absent_as_none(store.earnings_summary(user_id).await).map_err(|e| {
                    error!("Failed to load earnings summary for {}: {}", user_id, e);
                    TrackerError::fetch(e)
                })?;
                let (earnings, reported) = summary
                    .map(|s| (s.lifetime_earnings, s.current_level))
                    .unwrap_or((0.0, None));

                let since = Utc::now() - chrono::Duration::days(i64::from(window_days));
                let recent = store.completed_earnings_since(user_id, since).await.map_err(|e| {
                    error!("Failed to load recent earnings for {}: {}", user_id, e);
                    TrackerError::fetch(e)
                })?;

                let earned: f64 = recent
                    .iter()
                    .filter(|t| t.status == TransactionStatus::Completed)
                    .map(|t| t.amount)
                    .sum();
                let velocity = earned / f64::from(window_days);
                let velocity = if velocity > 0.0 { velocity } else { DEFAULT_DAILY_VELOCITY };

                Ok(LevelProgression::compute(
                    earnings,
                    resolve_level(earnings, reported),
                    velocity,
                ))
            })
            .await?;

        self.observe_level(progression.current_level).await;
        Some(progression)
    }

    /// Advance the watermark; toast only on a strict increase over a level
    /// this instance has already seen.
    async fn observe_level(&self, level: u32) {
        let mut watermark = self.level_watermark.lock().await;
        match *watermark {
            Some(seen) if level > seen => {
                *watermark = Some(level);
                let title = tables::level_info(level).map_or("", |l| l.title);
                info!("{} reached level {} ({})", self.ctx.user_id, level, title);
                self.ctx.notifier.notify(Notification::info(
                    "Level up!",
                    format!("You reached level {}: {}.", level, title),
                ));
            }
            Some(_) => {}
            None => *watermark = Some(level),
        }
    }

    pub fn level_info(level: u32) -> Option<&'static LevelThreshold> {
        tables::level_info(level)
    }

    pub fn all_levels() -> &'static [LevelThreshold] {
        tables::LEVELS
    }

    /// 100 for passed levels, live progress for the current one, 0 beyond.
    pub async fn progress_toward_level(&self, target_level: u32) -> f64 {
        self.core
            .read(|d| match d {
                Some(p) if target_level < p.current_level => 100.0,
                Some(p) if target_level == p.current_level => p.progress_percentage,
                _ => 0.0,
            })
            .await
    }

    pub async fn is_level_unlocked(&self, level: u32) -> bool {
        self.core
            .read(|d| d.is_some_and(|p| p.current_level >= level))
            .await
    }

    /// Days until `target_level`, scaling the single-step estimate by the
    /// number of levels left.
    pub async fn estimate_time_to_level(&self, target_level: u32) -> Option<u32> {
        self.core
            .read(|d| {
                let p = d?;
                if p.current_level >= target_level {
                    return Some(0);
                }
                if target_level > tables::max_level() {
                    return None;
                }
                let step = p.estimated_days_to_next_level?;
                Some(step.saturating_mul(target_level - p.current_level))
            })
            .await
    }

    pub async fn has_benefit(&self, benefit: &str) -> bool {
        self.core
            .read(|d| d.is_some_and(|p| p.benefits.iter().any(|b| *b == benefit)))
            .await
    }

    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, TrackerError> {
        let filter = FeedFilter::new(Collection::EarningsSummaries, self.ctx.user_id);
        match self.ctx.feed.subscribe(filter).await {
            Ok(stream) => Ok(spawn_listener(filter, Arc::downgrade(self), stream)),
            Err(e) => {
                error!("Level subscription failed for {}: {}", self.ctx.user_id, e);
                let err = TrackerError::subscription(e);
                self.core.set_error(err.clone()).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Tracker for LevelTracker {
    type Data = LevelProgression;

    async fn snapshot(&self) -> Snapshot<LevelProgression> {
        self.core.snapshot().await
    }

    async fn refresh(&self) {
        self.fetch(true).await;
    }
}

#[async_trait]
impl ChangeHandler for LevelTracker {
    async fn on_change(&self, event: ChangeEvent) {
        let Row::EarningsSummary(summary) = &event.new else {
            return;
        };

        let level = resolve_level(summary.lifetime_earnings, summary.current_level).level;
        debug!("Earnings summary changed for {}: level {}", summary.user_id, level);
        self.observe_level(level).await;

        self.core.invalidate().await;
        self.fetch(true).await;
    }

    async fn on_feed_error(&self, err: FeedError) {
        error!("Level feed failed for {}: {}", self.ctx.user_id, err);
        self.core.invalidate().await;
        self.core.set_error(TrackerError::subscription(err)).await;
    }
}
