//! Machinery shared by every tracker: a displayed snapshot, a TTL cache in
//! front of the store, load bookkeeping, and the non-fatal error slot.
//!
//! Loads are ticketed. A load that finishes after a newer load has already
//! been applied is dropped, so a slow fetch that started before a write can
//! never overwrite the re-fetch that followed the write. A pushed patch
//! supersedes every load issued before it in the same way.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::error::TrackerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Uninitialized,
    Loading,
    Ready,
    /// Last load failed. Any earlier data is still displayed.
    Error,
}

/// What consumers render: data plus the loading/updating/error flags.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<T> {
    pub data: Option<T>,
    pub phase: Phase,
    pub is_loading: bool,
    pub is_updating: bool,
    pub error: Option<TrackerError>,
}

/// The contract every tracker satisfies towards its consumers.
#[async_trait]
pub trait Tracker: Send + Sync {
    type Data: Clone + Send + Sync + 'static;

    async fn snapshot(&self) -> Snapshot<Self::Data>;

    /// Reload from the store, bypassing the cache.
    async fn refresh(&self);
}

struct State<T> {
    data: Option<T>,
    error: Option<TrackerError>,
    cache: TtlCache<T>,
    in_flight: usize,
    issued: u64,
    applied: u64,
}

impl<T> State<T> {
    fn phase(&self) -> Phase {
        if self.in_flight > 0 {
            Phase::Loading
        } else if self.error.is_some() {
            Phase::Error
        } else if self.data.is_some() {
            Phase::Ready
        } else {
            Phase::Uninitialized
        }
    }
}

/// Reads of a load that keeps being overtaken by patches before anything
/// was displayed.
const MAX_LOAD_ATTEMPTS: u32 = 3;

pub(crate) struct TrackerCore<T> {
    label: &'static str,
    state: RwLock<State<T>>,
    updating: AtomicUsize,
}

/// Holds the `is_updating` flag up for the duration of a write.
pub(crate) struct UpdateGuard<'a> {
    counter: &'a AtomicUsize,
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: Clone + Send + Sync> TrackerCore<T> {
    pub fn new(label: &'static str, ttl: Duration) -> Self {
        Self {
            label,
            state: RwLock::new(State {
                data: None,
                error: None,
                cache: TtlCache::new(ttl),
                in_flight: 0,
                issued: 0,
                applied: 0,
            }),
            updating: AtomicUsize::new(0),
        }
    }

    /// Serve from cache when fresh and allowed, otherwise run `source` and
    /// publish its result. Returns the data now displayed, or `None` when the
    /// load failed.
    pub async fn load<F, Fut>(&self, skip_cache: bool, source: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        self.load_with(skip_cache, source, |_| ()).await
    }

    /// Like `load`, running `on_apply` under the state lock when the result
    /// is published.
    ///
    /// A result older than the last patch never replaces the patched data.
    /// If nothing was displayed when the patch landed, `source` runs again.
    pub async fn load_with<F, Fut>(
        &self,
        skip_cache: bool,
        mut source: F,
        on_apply: impl FnOnce(&T),
    ) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TrackerError>>,
    {
        let mut ticket = {
            let mut state = self.state.write().await;
            if !skip_cache {
                if let Some(hit) = state.cache.get(Instant::now()) {
                    debug!("{}: cache hit", self.label);
                    return Some(hit.clone());
                }
            }
            state.in_flight += 1;
            state.issued += 1;
            state.issued
        };
        let mut attempts = 1;

        loop {
            let result = source().await;

            let mut state = self.state.write().await;
            let superseded = ticket <= state.applied;

            if superseded && state.data.is_none() && result.is_ok() && attempts < MAX_LOAD_ATTEMPTS {
                debug!("{}: load #{} overtaken by a patch, reading again", self.label, ticket);
                state.issued += 1;
                ticket = state.issued;
                attempts += 1;
                continue;
            }

            state.in_flight -= 1;
            return match result {
                Ok(data) => {
                    if superseded {
                        debug!("{}: discarding superseded load #{}", self.label, ticket);
                    } else {
                        state.applied = ticket;
                        on_apply(&data);
                        state.cache.put(data.clone(), Instant::now());
                        state.data = Some(data);
                        state.error = None;
                    }
                    state.data.clone()
                }
                Err(e) => {
                    warn!("{}: load failed: {}", self.label, e);
                    if !superseded {
                        state.error = Some(e);
                    }
                    None
                }
            };
        }
    }

    pub async fn snapshot(&self) -> Snapshot<T> {
        let state = self.state.read().await;
        Snapshot {
            data: state.data.clone(),
            phase: state.phase(),
            is_loading: state.in_flight > 0,
            is_updating: self.updating.load(Ordering::SeqCst) > 0,
            error: state.error.clone(),
        }
    }

    pub async fn data(&self) -> Option<T> {
        self.state.read().await.data.clone()
    }

    /// Inspect the latest displayed data without cloning it.
    pub async fn read<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        let state = self.state.read().await;
        f(state.data.as_ref())
    }

    /// Read-modify-write on the latest displayed data. Returns `false` when
    /// nothing was loaded yet.
    pub async fn patch(&self, f: impl FnOnce(&mut T)) -> bool {
        self.update(|data| match data {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        })
        .await
    }

    /// Apply a pushed change. Always invalidates the cache, and every load
    /// issued before this call is superseded, so a fetch that started
    /// earlier can neither overwrite the change nor be cached.
    pub async fn update<R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut state = self.state.write().await;
        state.cache.invalidate();
        state.applied = state.issued;
        f(state.data.as_mut())
    }

    pub async fn invalidate(&self) {
        self.state.write().await.cache.invalidate();
    }

    pub async fn set_error(&self, err: TrackerError) {
        self.state.write().await.error = Some(err);
    }

    pub fn begin_update(&self) -> UpdateGuard<'_> {
        self.updating.fetch_add(1, Ordering::SeqCst);
        UpdateGuard {
            counter: &self.updating,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use tokio::sync::Notify;

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_source() {
        let core = TrackerCore::new("test", Duration::from_secs(30));
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let source = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TrackerError>(1)
        };

        assert_eq!(core.load(false, source).await, Some(1));
        assert_eq!(core.load(false, source).await, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(core.load(true, source).await, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        core.load(false, source).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_data() {
        let core = TrackerCore::new("test", Duration::ZERO);
        core.load(true, || async { Ok::<_, TrackerError>(10) }).await;

        let res = core
            .load(true, || async { Err::<i32, _>(TrackerError::fetch("offline")) })
            .await;
        assert!(res.is_none());

        let snap = core.snapshot().await;
        assert_eq!(snap.data, Some(10));
        assert_eq!(snap.phase, Phase::Error);
        assert!(matches!(snap.error, Some(TrackerError::TransientFetchFailure(_))));

        // A successful reload clears the error
        core.load(true, || async { Ok::<_, TrackerError>(11) }).await;
        let snap = core.snapshot().await;
        assert_eq!(snap.phase, Phase::Ready);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn test_superseded_load_is_discarded() {
        let core = Arc::new(TrackerCore::new("test", Duration::ZERO));
        let gate = Arc::new(Notify::new());

        // Slow load starts first and reads the old value
        let slow = {
            let core = core.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                core.load(true, || {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, TrackerError>("stale")
                    }
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // Newer load completes first
        core.load(true, || async { Ok::<_, TrackerError>("fresh") }).await;
        gate.notify_one();

        assert_eq!(slow.await.unwrap(), Some("fresh"));
        assert_eq!(core.data().await, Some("fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_during_load_is_kept_and_not_cached() {
        let core = Arc::new(TrackerCore::new("test", Duration::from_secs(60)));
        core.load(false, || async { Ok::<_, TrackerError>(1) }).await;

        let gate = Arc::new(Notify::new());
        let slow = {
            let core = core.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                core.load(true, || {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, TrackerError>(1)
                    }
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // The push lands while the read is in flight
        assert!(core.patch(|v| *v += 10).await);
        gate.notify_one();

        assert_eq!(slow.await.unwrap(), Some(11));
        assert_eq!(core.data().await, Some(11));
        assert!(!core.snapshot().await.is_loading);

        // The stale result was not cached either
        let calls = AtomicU32::new(0);
        let calls = &calls;
        core.load(false, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TrackerError>(11)
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_load_overtaken_by_patch_reads_again() {
        let core = Arc::new(TrackerCore::new("test", Duration::from_secs(60)));
        let gate = Arc::new(Notify::new());
        let reads = Arc::new(AtomicU32::new(0));

        let first = {
            let core = core.clone();
            let gate = gate.clone();
            let reads = reads.clone();
            tokio::spawn(async move {
                core.load(false, || {
                    let gate = gate.clone();
                    let reads = reads.clone();
                    async move {
                        // Only the first read blocks
                        if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                            gate.notified().await;
                            Ok::<_, TrackerError>("before push")
                        } else {
                            Ok("after push")
                        }
                    }
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        assert!(!core.patch(|v: &mut &str| *v = "patched").await);
        gate.notify_one();

        assert_eq!(first.await.unwrap(), Some("after push"));
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert_eq!(core.snapshot().await.phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_patch_invalidates_cache() {
        let core = TrackerCore::new("test", Duration::from_secs(60));
        assert!(!core.patch(|v: &mut i32| *v += 1).await);

        core.load(false, || async { Ok::<_, TrackerError>(1) }).await;
        assert!(core.patch(|v| *v += 1).await);
        assert_eq!(core.data().await, Some(2));

        // Cache was dropped, so the source runs again
        let reloaded = core.load(false, || async { Ok::<_, TrackerError>(5) }).await;
        assert_eq!(reloaded, Some(5));
    }

    #[tokio::test]
    async fn test_update_guard() {
        let core: TrackerCore<i32> = TrackerCore::new("test", Duration::ZERO);
        {
            let _guard = core.begin_update();
            assert!(core.snapshot().await.is_updating);
        }
        assert!(!core.snapshot().await.is_updating);
        assert_eq!(core.snapshot().await.phase, Phase::Uninitialized);
    }
}
