use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::lead_scorer::{ScoringConfig, TierThresholds};
use crate::retry_queue::{RetryPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: PathBuf,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub cache_max_sessions: u64,
    pub analytics_top_tags: usize,
    /// Scan user messages for email, phone and service mentions.
    pub detect_signals: bool,
    pub scoring: ScoringConfig,
    pub tiers: TierThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("lead_sessions.db"),
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_BASE_DELAY_MS,
            cache_max_sessions: 10_000,
            analytics_top_tags: 5,
            detect_signals: true,
            scoring: ScoringConfig::default(),
            tiers: TierThresholds::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let retry_max_attempts: u32 =
            parse_or(&lookup, "LEAD_RETRY_MAX_ATTEMPTS", defaults.retry_max_attempts)?;
        if retry_max_attempts == 0 {
            return Err(anyhow::anyhow!("LEAD_RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        let cache_max_sessions: u64 =
            parse_or(&lookup, "LEAD_CACHE_MAX_SESSIONS", defaults.cache_max_sessions)?;
        if cache_max_sessions == 0 {
            return Err(anyhow::anyhow!("LEAD_CACHE_MAX_SESSIONS must be at least 1"));
        }

        Ok(Self {
            db_path: lookup("LEAD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            retry_max_attempts,
            retry_base_delay_ms: parse_or(
                &lookup,
                "LEAD_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay_ms,
            )?,
            cache_max_sessions,
            analytics_top_tags: parse_or(
                &lookup,
                "LEAD_ANALYTICS_TOP_TAGS",
                defaults.analytics_top_tags,
            )?,
            detect_signals: parse_or(&lookup, "LEAD_DETECT_SIGNALS", defaults.detect_signals)?,
            scoring: defaults.scoring,
            tiers: defaults.tiers,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn print_config(&self) {
        info!("Lead engine configuration:");
        info!("  Database: {}", self.db_path.display());
        info!(
            "  Retry: {} attempts, base delay {} ms",
            self.retry_max_attempts, self.retry_base_delay_ms
        );
        info!("  Cache capacity: {} sessions", self.cache_max_sessions);
        info!("  Analytics top tags: {}", self.analytics_top_tags);
        info!("  Signal detection: {}", self.detect_signals);
        info!(
            "  Tier thresholds: browsing {}, interested {}, hot {}",
            self.tiers.browsing, self.tiers.interested, self.tiers.hot
        );
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        _ => Ok(default),
    }
}
