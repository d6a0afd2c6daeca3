use std::sync::Weak;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tally_types::events::{ChangeEvent, FeedFilter};

use crate::error::FeedError;

pub type FeedStream = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// Push channel delivering row changes for one `{collection, user}` filter.
///
/// Delivery is at least once; handlers must tolerate duplicates.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, FeedError>;
}

/// Adapt a broadcast receiver into a filtered feed stream. A lagging receiver
/// yields `FeedError::Lagged`; a closed channel yields `FeedError::Closed` once
/// and then ends.
pub fn broadcast_stream(rx: broadcast::Receiver<ChangeEvent>, filter: FeedFilter) -> FeedStream {
    stream::unfold(Some(rx), move |rx| async move {
        let mut rx = rx?;
        loop {
            match rx.recv().await {
                Ok(event) if filter.matches(&event) => return Some((Ok(event), Some(rx))),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => return Some((Err(FeedError::Lagged(n)), Some(rx))),
                Err(RecvError::Closed) => return Some((Err(FeedError::Closed), None)),
            }
        }
    })
    .boxed()
}

/// Reconciles pushed row changes into a tracker's in-memory state.
#[async_trait]
pub(crate) trait ChangeHandler: Send + Sync + 'static {
    async fn on_change(&self, event: ChangeEvent);

    /// The feed failed; live updates stop after this call.
    async fn on_feed_error(&self, err: FeedError);
}

/// Live subscription handle. Dropping it tears the listener down.
pub struct Subscription {
    filter: FeedFilter,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn filter(&self) -> FeedFilter {
        self.filter
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Drive `stream` into `handler` until the feed fails, the handle is dropped,
/// or the tracker itself is gone.
pub(crate) fn spawn_listener<H: ChangeHandler>(
    filter: FeedFilter,
    handler: Weak<H>,
    mut stream: FeedStream,
) -> Subscription {
    info!("Subscribed to {:?} changes for {}", filter.collection, filter.user_id);

    let task = tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let Some(handler) = handler.upgrade() else {
                debug!("Tracker dropped, stopping {:?} listener", filter.collection);
                break;
            };

            match item {
                // Filtering is the feed's job, but a foreign row must never be patched in
                Ok(event) if filter.matches(&event) => handler.on_change(event).await,
                Ok(event) => {
                    warn!("Ignoring {:?} event outside subscription filter", event.collection());
                }
                Err(e) => {
                    handler.on_feed_error(e).await;
                    break;
                }
            }
        }
        debug!("{:?} listener stopped", filter.collection);
    });

    Subscription { filter, task }
}
