use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};

use tally_engine::{ChangeFeed, FeedError, FeedStream, broadcast_stream};
use tally_types::events::{ChangeEvent, FeedFilter};

const CHANNEL_CAPACITY: usize = 1024;

/// In-process change feed. Every row change is broadcast once; each
/// subscriber's stream keeps only the rows matching its filter.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// `None` once shut down
    broadcast_tx: RwLock<Option<broadcast::Sender<ChangeEvent>>>,

    published: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx: RwLock::new(Some(broadcast_tx)),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Publish a row change to every subscriber. A no-op after shutdown.
    pub async fn publish(&self, event: ChangeEvent) {
        let tx = self.inner.broadcast_tx.read().await;
        let Some(tx) = tx.as_ref() else {
            debug!("Dropping {:?} event after shutdown", event.collection());
            return;
        };

        self.inner.published.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error
        let _ = tx.send(event);
    }

    /// Number of live subscriber streams, across all filters.
    pub async fn subscriber_count(&self) -> usize {
        self.inner
            .broadcast_tx
            .read()
            .await
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Close the feed. Every open stream yields `FeedError::Closed` and ends.
    pub async fn shutdown(&self) {
        if self.inner.broadcast_tx.write().await.take().is_some() {
            info!("Change feed closed after {} events", self.published());
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChangeFeed for Dispatcher {
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedStream, FeedError> {
        let tx = self.inner.broadcast_tx.read().await;
        let tx = tx.as_ref().ok_or(FeedError::Closed)?;
        debug!("Feed subscriber for {:?}/{}", filter.collection, filter.user_id);
        Ok(broadcast_stream(tx.subscribe(), filter))
    }
}
