use std::time::Duration;

use tokio::time::Instant;

/// Single-slot snapshot cache. An entry is served only while
/// `now - stored_at < ttl`.
#[derive(Debug)]
pub struct TtlCache<T> {
    ttl: Duration,
    entry: Option<CacheEntry<T>>,
}

#[derive(Debug)]
struct CacheEntry<T> {
    data: T,
    stored_at: Instant,
}

impl<T> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entry: None }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, now: Instant) -> Option<&T> {
        let entry = self.entry.as_ref()?;
        if now.saturating_duration_since(entry.stored_at) < self.ttl {
            Some(&entry.data)
        } else {
            None
        }
    }

    pub fn put(&mut self, data: T, now: Instant) {
        self.entry = Some(CacheEntry {
            data,
            stored_at: now,
        });
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}
