use serde::{Deserialize, Serialize};

use crate::tables::ChallengeType;
use crate::models::ChallengeStatus;

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationVariant {
    #[default]
    Default,
    Destructive,
}

/// A fire-and-forget toast shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub variant: NotificationVariant,
}

impl Notification {
    pub fn info(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            variant: NotificationVariant::Default,
        }
    }

    pub fn destructive(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            variant: NotificationVariant::Destructive,
        }
    }
}

// -- Trust --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateScoreRequest {
    pub delta: i32,
    pub reason: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CanPerformQuery {
    pub required: i32,
}

// -- Challenges --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProgressRequest {
    pub progress: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ChallengeQuery {
    pub status: Option<ChallengeStatus>,
    #[serde(rename = "type")]
    pub challenge_type: Option<ChallengeType>,
}

// -- Shared --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
