use std::fmt::Display;

use serde::Serialize;

/// Failures reported by the persistence layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("store unavailable: {0}")]
    Backend(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Failures reported by the change feed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeedError {
    #[error("change feed closed")]
    Closed,

    #[error("change feed lagged, {0} events dropped")]
    Lagged(u64),

    #[error("change feed error: {0}")]
    Channel(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("clipboard unavailable: {0}")]
pub struct ClipboardError(pub String);

/// The `error` field every tracker exposes. Never fatal: previously loaded
/// data stays visible alongside it.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum TrackerError {
    #[error("failed to load: {0}")]
    TransientFetchFailure(String),

    #[error("failed to save: {0}")]
    WriteFailure(String),

    #[error("not allowed: {0}")]
    Rejected(String),

    #[error("live updates stopped: {0}")]
    SubscriptionFailure(String),

    #[error("unknown challenge: {0}")]
    UnknownChallenge(String),
}

impl TrackerError {
    pub(crate) fn fetch(err: impl Display) -> Self {
        Self::TransientFetchFailure(err.to_string())
    }

    /// A store rejection stays distinguishable from an unavailable store.
    pub(crate) fn write(err: &StoreError) -> Self {
        match err {
            StoreError::Rejected(reason) => Self::Rejected(reason.clone()),
            other => Self::WriteFailure(other.to_string()),
        }
    }

    pub(crate) fn subscription(err: impl Display) -> Self {
        Self::SubscriptionFailure(err.to_string())
    }
}

/// Folds `StoreError::NotFound` into `Ok(None)`; a missing record is a valid
/// default state, not a failure.
pub(crate) fn absent_as_none<T>(res: Result<Option<T>, StoreError>) -> Result<Option<T>, StoreError> {
    match res {
        Err(StoreError::NotFound) => Ok(None),
        other => other,
    }
}
