use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use tally_db::SqliteStore;
use tally_engine::{EngineConfig, EngineContext, TrackerError};

use crate::session::{Session, SessionClipboard, SessionNotifier};

pub type AppState = Arc<AppStateInner>;

/// Sessions untouched for this long are dropped by `evict_idle`.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(15 * 60);

pub struct AppStateInner {
    pub store: SqliteStore,
    pub config: EngineConfig,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    idle_timeout: Duration,
}

impl AppStateInner {
    pub fn new(store: SqliteStore, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            sessions: RwLock::new(HashMap::new()),
            idle_timeout: DEFAULT_SESSION_IDLE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// The user's session, created on first use: subscribed to the feed and
    /// loaded once before it is returned.
    pub async fn session(&self, user_id: Uuid) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(&user_id) {
            session.touch();
            return session.clone();
        }

        let notifier = Arc::new(SessionNotifier::new(user_id));
        let clipboard = Arc::new(SessionClipboard::default());
        let ctx = EngineContext {
            user_id,
            store: Arc::new(self.store.clone()),
            feed: Arc::new(self.store.dispatcher().clone()),
            notifier: notifier.clone(),
            clipboard: clipboard.clone(),
            config: self.config.clone(),
        };
        let session = Arc::new(Session::new(ctx, notifier, clipboard));

        // Subscribe before loading so no change lands between the two
        session.engine.subscribe_all().await;
        session.engine.load_all().await;

        // A concurrent request may have won the race; its session is kept
        // and ours is dropped along with its listeners.
        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(user_id).or_insert(session).clone();
        session.touch();
        info!("Session open for {} ({} active)", user_id, sessions.len());
        session
    }

    pub async fn end_session(&self, user_id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&user_id).is_some();
        if removed {
            info!("Session closed for {}", user_id);
        }
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle for at least the idle timeout. A request still
    /// holding one keeps it alive until the request ends.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|user_id, session| {
            let alive = session.idle_for(now) < self.idle_timeout;
            if !alive {
                debug!("Evicting idle session for {}", user_id);
            }
            alive
        });
        before - sessions.len()
    }

    /// Drop every session, stopping all feed listeners.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        info!("Closing {} sessions", sessions.len());
        sessions.clear();
    }
}

/// Background task that evicts idle sessions every `interval`.
pub async fn run_session_sweeper(state: AppState, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        let evicted = state.evict_idle().await;
        if evicted > 0 {
            info!("Sweep: evicted {} idle sessions ({} active)", evicted, state.session_count().await);
        }
    }
}

/// Status for a mutation that returned `false`, from the error it left on
/// the tracker.
pub(crate) fn failure_status(err: Option<&TrackerError>) -> StatusCode {
    match err {
        Some(TrackerError::UnknownChallenge(_)) => StatusCode::NOT_FOUND,
        Some(TrackerError::Rejected(_)) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
