//! Tally rewards engine
//!
//! Four reactive trackers over one user's rewards data:
//! - Trust: bounded reputation score, history, and the action gate
//! - Level: lifetime earnings mapped onto the level table
//! - Referral: sponsored accounts, tier, and referral codes
//! - Challenge: the fixed challenge catalog joined with the user's progress
//!
//! Each tracker owns a TTL cache in front of the store and patches its state
//! from the change feed between explicit refreshes.

pub mod cache;
pub mod challenge;
pub mod config;
pub mod error;
pub mod feed;
pub mod level;
pub mod notify;
pub mod referral;
pub mod store;
pub mod tracker;
pub mod trust;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub use challenge::ChallengeTracker;
pub use config::EngineConfig;
pub use error::{ClipboardError, FeedError, StoreError, TrackerError};
pub use feed::{ChangeFeed, FeedStream, Subscription, broadcast_stream};
pub use level::LevelTracker;
pub use notify::{Clipboard, Notifier};
pub use referral::{ReferralOverview, ReferralTracker};
pub use store::RewardsStore;
pub use tracker::{Phase, Snapshot, Tracker};
pub use trust::TrustTracker;

/// Everything a tracker is constructed with. Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub user_id: Uuid,
    pub store: Arc<dyn RewardsStore>,
    pub feed: Arc<dyn ChangeFeed>,
    pub notifier: Arc<dyn Notifier>,
    pub clipboard: Arc<dyn Clipboard>,
    pub config: EngineConfig,
}

/// One user's four trackers and their live subscriptions.
pub struct RewardsEngine {
    pub user_id: Uuid,
    pub trust: Arc<TrustTracker>,
    pub level: Arc<LevelTracker>,
    pub referral: Arc<ReferralTracker>,
    pub challenge: Arc<ChallengeTracker>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl RewardsEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            user_id: ctx.user_id,
            trust: TrustTracker::new(ctx.clone()),
            level: LevelTracker::new(ctx.clone()),
            referral: ReferralTracker::new(ctx.clone()),
            challenge: ChallengeTracker::new(ctx),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe every tracker to its collection. A tracker whose
    /// subscription fails carries the error in its snapshot and keeps
    /// serving fetched data; the others still go live. Returns the number of
    /// live subscriptions.
    pub async fn subscribe_all(&self) -> usize {
        let results = [
            self.trust.subscribe().await,
            self.level.subscribe().await,
            self.referral.subscribe().await,
            self.challenge.subscribe().await,
        ];

        let mut subs = self.subscriptions.lock().await;
        subs.clear();
        for result in results {
            match result {
                Ok(sub) => subs.push(sub),
                Err(e) => warn!("Session for {} is missing live updates: {}", self.user_id, e),
            }
        }
        info!("Session for {}: {} live subscriptions", self.user_id, subs.len());
        subs.len()
    }

    /// Drop every subscription. In-flight fetches still complete.
    pub async fn unsubscribe_all(&self) {
        self.subscriptions.lock().await.clear();
    }

    pub async fn live_subscriptions(&self) -> usize {
        self.subscriptions
            .lock()
            .await
            .iter()
            .filter(|s| s.is_active())
            .count()
    }

    /// Initial load of all four trackers, served from cache where fresh.
    pub async fn load_all(&self) {
        tokio::join!(
            self.trust.fetch(false),
            self.level.fetch(false),
            self.referral.fetch(false),
            self.challenge.fetch(),
        );
    }
}
