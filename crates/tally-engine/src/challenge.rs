use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tally_types::api::Notification;
use tally_types::events::{ChangeEvent, ChangeKind, Collection, FeedFilter, Row};
use tally_types::models::{ChallengeProgress, ChallengeStatus, ChallengeWithProgress};
use tally_types::tables::{self, CHALLENGES, ChallengeDefinition, ChallengeType};

use crate::EngineContext;
use crate::error::{FeedError, TrackerError};
use crate::feed::{ChangeHandler, Subscription, spawn_listener};
use crate::tracker::{Snapshot, Tracker, TrackerCore};

/// Join the catalog against the user's progress rows, in catalog order.
pub fn join_catalog(rows: &[ChallengeProgress]) -> Vec<ChallengeWithProgress> {
    for row in rows {
        if tables::challenge(&row.challenge_id).is_none() {
            debug!("Ignoring progress for retired challenge {}", row.challenge_id);
        }
    }

    CHALLENGES
        .iter()
        .map(|challenge| ChallengeWithProgress {
            challenge,
            user_progress: rows.iter().find(|r| r.challenge_id == challenge.id).cloned(),
        })
        .collect()
}

/// Challenges without progress have no status and never match.
pub fn filter_by_status(
    challenges: &[ChallengeWithProgress],
    status: ChallengeStatus,
) -> Vec<ChallengeWithProgress> {
    challenges
        .iter()
        .filter(|c| c.status() == Some(status))
        .cloned()
        .collect()
}

pub fn filter_by_type(
    challenges: &[ChallengeWithProgress],
    challenge_type: ChallengeType,
) -> Vec<ChallengeWithProgress> {
    challenges
        .iter()
        .filter(|c| c.challenge.challenge_type == challenge_type)
        .cloned()
        .collect()
}

/// Completed but not yet claimed.
pub fn unclaimed(challenges: &[ChallengeWithProgress]) -> Vec<ChallengeWithProgress> {
    challenges.iter().filter(|c| c.is_unclaimed()).cloned().collect()
}

pub fn total_rewards_available(challenges: &[ChallengeWithProgress]) -> i64 {
    challenges
        .iter()
        .filter(|c| c.is_unclaimed())
        .map(|c| c.challenge.points_reward)
        .sum()
}

/// Did this event move the challenge into completed?
fn entered_completion(kind: ChangeKind, old: Option<&ChallengeProgress>, new: &ChallengeProgress) -> bool {
    if new.status != ChallengeStatus::Completed {
        return false;
    }
    match old {
        Some(old) => old.status != ChallengeStatus::Completed,
        None => match kind {
            ChangeKind::Insert => true,
            // Without the old row, only an unclaimed completion can be new
            ChangeKind::Update => !new.reward_claimed,
        },
    }
}

/// The fixed challenge catalog joined with the user's progress.
pub struct ChallengeTracker {
    ctx: EngineContext,
    core: TrackerCore<Vec<ChallengeWithProgress>>,
    /// Challenges whose completion toast has already fired.
    notified: Mutex<HashSet<String>>,
}

impl ChallengeTracker {
    pub fn new(ctx: EngineContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            // Not cached: every fetch reads the store
            core: TrackerCore::new("challenge", Duration::ZERO),
            notified: Mutex::new(HashSet::new()),
        })
    }

    pub async fn fetch(&self) -> Option<Vec<ChallengeWithProgress>> {
        let store = &self.ctx.store;
        let user_id = self.ctx.user_id;

        self.core
            .load(true, || async move {
                let rows = store.challenge_progress(user_id).await.map_err(|e| {
                    error!("Failed to load challenge progress for {}: {}", user_id, e);
                    TrackerError::fetch(e)
                })?;
                Ok(join_catalog(&rows))
            })
            .await
    }

    fn definition(&self, challenge_id: &str) -> Result<&'static ChallengeDefinition, TrackerError> {
        tables::challenge(challenge_id).ok_or_else(|| {
            warn!("Unknown challenge {} for {}", challenge_id, self.ctx.user_id);
            TrackerError::UnknownChallenge(challenge_id.to_string())
        })
    }

    async fn write_failed(&self, err: TrackerError, description: &str) -> bool {
        self.core.set_error(err).await;
        self.ctx
            .notifier
            .notify(Notification::destructive("Error", description));
        false
    }

    /// Create or update the progress row. Completion is stamped once, on the
    /// transition; dropping back below the target reopens the challenge
    /// unless its reward was already claimed.
    pub async fn update_progress(&self, challenge_id: &str, new_progress: i64) -> bool {
        let _updating = self.core.begin_update();

        let challenge = match self.definition(challenge_id) {
            Ok(c) => c,
            Err(e) => return self.write_failed(e, "Unknown challenge").await,
        };

        let existing = match self
            .ctx
            .store
            .challenge_progress_for(self.ctx.user_id, challenge_id)
            .await
        {
            Ok(existing) => existing,
            Err(e) => {
                error!("Failed to read progress for {}: {}", challenge_id, e);
                return self
                    .write_failed(TrackerError::write(&e), "Failed to update challenge progress")
                    .await;
            }
        };

        let status = ChallengeStatus::for_progress(new_progress, challenge.target_value);
        let now = Utc::now();

        let row = match existing {
            Some(current) => {
                if current.reward_claimed && status != ChallengeStatus::Completed {
                    warn!(
                        "Rejecting progress {} for claimed challenge {} ({})",
                        new_progress, challenge_id, self.ctx.user_id
                    );
                    return self
                        .write_failed(
                            TrackerError::Rejected(format!(
                                "reward for {} already claimed",
                                challenge_id
                            )),
                            "Progress cannot go back on a claimed challenge",
                        )
                        .await;
                }

                let completion_date = match status {
                    ChallengeStatus::Completed => current.completion_date.or(Some(now)),
                    ChallengeStatus::Active => None,
                };
                ChallengeProgress {
                    progress: new_progress,
                    target_value: challenge.target_value,
                    status,
                    completion_date,
                    ..current
                }
            }
            None => ChallengeProgress {
                id: Uuid::new_v4(),
                user_id: self.ctx.user_id,
                challenge_id: challenge_id.to_string(),
                progress: new_progress,
                target_value: challenge.target_value,
                status,
                completion_date: (status == ChallengeStatus::Completed).then_some(now),
                reward_claimed: false,
                claim_date: None,
            },
        };

        if let Err(e) = self.ctx.store.upsert_challenge_progress(&row).await {
            error!("Failed to save progress for {}: {}", challenge_id, e);
            return self
                .write_failed(TrackerError::write(&e), "Failed to update challenge progress")
                .await;
        }

        info!(
            "Challenge {} for {}: {}/{} ({})",
            challenge_id,
            self.ctx.user_id,
            new_progress,
            challenge.target_value,
            status.as_str()
        );

        self.fetch().await;
        true
    }

    /// Claim the reward of a completed challenge. Returns `false` without
    /// writing when the challenge was never started, is not completed yet, or
    /// was already claimed.
    pub async fn claim_reward(&self, challenge_id: &str) -> bool {
        self.try_claim_reward(challenge_id).await.unwrap_or(false)
    }

    /// As `claim_reward`, but a failure is returned instead of folded into
    /// `false`. `Ok(false)` means there was nothing to claim.
    pub async fn try_claim_reward(&self, challenge_id: &str) -> Result<bool, TrackerError> {
        let _updating = self.core.begin_update();

        let challenge = match self.definition(challenge_id) {
            Ok(c) => c,
            Err(e) => {
                self.write_failed(e.clone(), "Unknown challenge").await;
                return Err(e);
            }
        };

        match self
            .ctx
            .store
            .claim_challenge_reward(self.ctx.user_id, challenge_id, challenge.points_reward, Utc::now())
            .await
        {
            Ok(true) => {
                info!(
                    "{} claimed {} points for {}",
                    self.ctx.user_id, challenge.points_reward, challenge_id
                );
                self.ctx.notifier.notify(Notification::info(
                    "Reward claimed!",
                    format!("You earned {} points.", challenge.points_reward),
                ));
                self.fetch().await;
                Ok(true)
            }
            Ok(false) => {
                debug!("Nothing to claim for {} ({})", challenge_id, self.ctx.user_id);
                Ok(false)
            }
            Err(e) => {
                error!("Failed to claim reward for {}: {}", challenge_id, e);
                let err = TrackerError::write(&e);
                self.write_failed(err.clone(), "Failed to claim reward").await;
                Err(err)
            }
        }
    }

    pub async fn challenges(&self) -> Vec<ChallengeWithProgress> {
        self.core.data().await.unwrap_or_default()
    }

    pub async fn filter_by_status(&self, status: ChallengeStatus) -> Vec<ChallengeWithProgress> {
        self.core
            .read(|d| d.map(|c| filter_by_status(c, status)).unwrap_or_default())
            .await
    }

    pub async fn filter_by_type(&self, challenge_type: ChallengeType) -> Vec<ChallengeWithProgress> {
        self.core
            .read(|d| d.map(|c| filter_by_type(c, challenge_type)).unwrap_or_default())
            .await
    }

    pub async fn active_challenges(&self) -> Vec<ChallengeWithProgress> {
        self.filter_by_status(ChallengeStatus::Active).await
    }

    pub async fn completed_challenges(&self) -> Vec<ChallengeWithProgress> {
        self.filter_by_status(ChallengeStatus::Completed).await
    }

    pub async fn unclaimed_challenges(&self) -> Vec<ChallengeWithProgress> {
        self.core
            .read(|d| d.map(|c| unclaimed(c)).unwrap_or_default())
            .await
    }

    pub async fn total_rewards_available(&self) -> i64 {
        self.core
            .read(|d| d.map_or(0, |c| total_rewards_available(c)))
            .await
    }

    pub async fn subscribe(self: &Arc<Self>) -> Result<Subscription, TrackerError> {
        let filter = FeedFilter::new(Collection::ChallengeProgress, self.ctx.user_id);
        match self.ctx.feed.subscribe(filter).await {
            Ok(stream) => Ok(spawn_listener(filter, Arc::downgrade(self), stream)),
            Err(e) => {
                error!("Challenge subscription failed for {}: {}", self.ctx.user_id, e);
                let err = TrackerError::subscription(e);
                self.core.set_error(err.clone()).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Tracker for ChallengeTracker {
    type Data = Vec<ChallengeWithProgress>;

    async fn snapshot(&self) -> Snapshot<Vec<ChallengeWithProgress>> {
        self.core.snapshot().await
    }

    async fn refresh(&self) {
        self.fetch().await;
    }
}

#[async_trait]
impl ChangeHandler for ChallengeTracker {
    async fn on_change(&self, event: ChangeEvent) {
        let Row::ChallengeProgress(new) = &event.new else {
            return;
        };
        let old = match &event.old {
            Some(Row::ChallengeProgress(old)) => Some(old),
            _ => None,
        };

        let toast = {
            let mut notified = self.notified.lock().await;
            if new.status != ChallengeStatus::Completed {
                notified.remove(&new.challenge_id);
                None
            } else if entered_completion(event.event_type, old, new)
                && notified.insert(new.challenge_id.clone())
            {
                tables::challenge(&new.challenge_id)
            } else {
                None
            }
        };

        if let Some(challenge) = toast {
            self.ctx.notifier.notify(Notification::info(
                "Challenge completed!",
                format!(
                    "You completed \"{}\". Claim your {} point reward.",
                    challenge.title, challenge.points_reward
                ),
            ));
        }

        let row = new.clone();
        self.core
            .patch(|challenges| {
                if let Some(slot) = challenges.iter_mut().find(|c| c.challenge.id == row.challenge_id) {
                    slot.user_progress = Some(row);
                }
            })
            .await;
    }

    async fn on_feed_error(&self, err: FeedError) {
        error!("Challenge feed failed for {}: {}", self.ctx.user_id, err);
        self.core.invalidate().await;
        self.core.set_error(TrackerError::subscription(err)).await;
    }
}
