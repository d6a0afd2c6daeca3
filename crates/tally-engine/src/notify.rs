use tally_types::api::Notification;

use crate::error::ClipboardError;

/// User-facing toast surface. Fire and forget.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// System clipboard used by `ReferralTracker::copy_referral_code`.
pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}
