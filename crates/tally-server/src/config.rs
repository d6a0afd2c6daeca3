use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use tally_api::DEFAULT_SESSION_IDLE;
use tally_engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub engine: EngineConfig,
    /// Sessions idle this long are dropped along with their feed listeners.
    pub session_idle: Duration,
    pub session_sweep: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables fall back to defaults; set but malformed ones are an
    /// error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            trust_ttl: secs(&lookup, "TALLY_TRUST_TTL_SECS", defaults.trust_ttl)?,
            level_ttl: secs(&lookup, "TALLY_LEVEL_TTL_SECS", defaults.level_ttl)?,
            referral_ttl: secs(&lookup, "TALLY_REFERRAL_TTL_SECS", defaults.referral_ttl)?,
            referral_page_size: parsed(&lookup, "TALLY_REFERRAL_PAGE_SIZE", defaults.referral_page_size)?,
            referral_base_url: lookup("TALLY_REFERRAL_BASE_URL")
                .unwrap_or(defaults.referral_base_url.clone()),
            ..defaults
        };
        if engine.referral_page_size == 0 {
            anyhow::bail!("TALLY_REFERRAL_PAGE_SIZE must be at least 1");
        }

        let session_sweep = secs(&lookup, "TALLY_SESSION_SWEEP_SECS", Duration::from_secs(60))?;
        if session_sweep.is_zero() {
            anyhow::bail!("TALLY_SESSION_SWEEP_SECS must be at least 1");
        }

        Ok(Self {
            db_path: PathBuf::from(lookup("TALLY_DB_PATH").unwrap_or_else(|| "tally.db".into())),
            host: lookup("TALLY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "TALLY_PORT", 3000)?,
            engine,
            session_idle: secs(&lookup, "TALLY_SESSION_IDLE_SECS", DEFAULT_SESSION_IDLE)?,
            session_sweep,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Result<Duration> {
    parsed(lookup, key, default.as_secs()).map(Duration::from_secs)
}
