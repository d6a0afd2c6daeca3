use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub trust_ttl: Duration,
    pub level_ttl: Duration,
    pub referral_ttl: Duration,
    /// Maximum number of trust history entries loaded with the score.
    pub history_limit: usize,
    /// Number of newest history deltas averaged for the trend.
    pub trend_window: usize,
    /// Trailing window used for the earning velocity, in days.
    pub velocity_window_days: u32,
    pub referral_page_size: usize,
    /// Origin used for referral links, e.g. `https://app.example.com`.
    pub referral_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trust_ttl: Duration::from_secs(60),
            level_ttl: Duration::from_secs(30),
            referral_ttl: Duration::from_secs(30),
            history_limit: 100,
            trend_window: 5,
            velocity_window_days: 7,
            referral_page_size: 10,
            referral_base_url: "https://app.example.com".into(),
        }
    }
}
