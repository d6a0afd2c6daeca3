use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use tally_engine::{Clipboard, ClipboardError, EngineContext, Notifier, RewardsEngine};
use tally_types::api::Notification;

/// Toasts kept per session until the client drains them.
const MAX_PENDING_NOTIFICATIONS: usize = 100;

/// Notification queue drained by `GET /users/{id}/notifications`.
pub struct SessionNotifier {
    user_id: Uuid,
    pending: Mutex<VecDeque<Notification>>,
}

impl SessionNotifier {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn drain(&self) -> Vec<Notification> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl Notifier for SessionNotifier {
    fn notify(&self, notification: Notification) {
        debug!("Notify {}: {}", self.user_id, notification.title);
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.len() == MAX_PENDING_NOTIFICATIONS {
            pending.pop_front();
        }
        pending.push_back(notification);
    }
}

/// Server-side stand-in for the browser clipboard: holds the last copied
/// text so the client can read it back from the copy response.
#[derive(Default)]
pub struct SessionClipboard {
    text: Mutex<Option<String>>,
}

impl SessionClipboard {
    pub fn contents(&self) -> Option<String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Clipboard for SessionClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = Some(text.to_string());
        Ok(())
    }
}

/// One user's live trackers. Dropping the session drops the engine, which
/// stops its feed listeners.
pub struct Session {
    pub engine: RewardsEngine,
    pub notifier: Arc<SessionNotifier>,
    pub clipboard: Arc<SessionClipboard>,
    last_seen: Mutex<Instant>,
}

impl Session {
    pub fn new(ctx: EngineContext, notifier: Arc<SessionNotifier>, clipboard: Arc<SessionClipboard>) -> Self {
        Self {
            engine: RewardsEngine::new(ctx),
            notifier,
            clipboard,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_seen.lock().unwrap_or_else(PoisonError::into_inner))
    }
}
