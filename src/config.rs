use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::model::Platform;

const CONFIG_FILE: &str = "harvest";
const ENV_PREFIX: &str = "HARVEST";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("no seed URL for platform {0}; pass --seed")]
    MissingSeed(Platform),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Runtime knobs for a harvest batch.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub max_concurrency: usize,
    pub rate_per_minute: u32,
    pub max_retries: u32,
    pub challenge_timeout_iterations: u32,
    pub politeness_delay_range: DelayRange,
    pub page_ceiling: u32,
    pub snapshot_every: u64,
    pub op_timeout_secs: u64,
    pub settle_delay_ms: u64,
    pub challenge_poll_ms: u64,
    pub base_backoff_ms: u64,
    pub db_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub store_raw_pages: bool,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_concurrency: 2,
            rate_per_minute: 5,
            max_retries: 3,
            challenge_timeout_iterations: 20,
            politeness_delay_range: DelayRange {
                min_ms: 1000,
                max_ms: 2000,
            },
            page_ceiling: 100,
            snapshot_every: 50,
            op_timeout_secs: 30,
            settle_delay_ms: 2000,
            challenge_poll_ms: 1000,
            base_backoff_ms: 2000,
            db_path: PathBuf::from("data/harvest.sqlite"),
            snapshot_path: PathBuf::from("data/checkpoint.json"),
            store_raw_pages: true,
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".into(),
        }
    }
}

impl Settings {
    /// Defaults, then `harvest.toml` if present, then `HARVEST_*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let settings: Settings = config::Config::builder()
            .set_default("max_concurrency", defaults.max_concurrency as u64)?
            .set_default("rate_per_minute", defaults.rate_per_minute as u64)?
            .set_default("max_retries", defaults.max_retries as u64)?
            .set_default(
                "challenge_timeout_iterations",
                defaults.challenge_timeout_iterations as u64,
            )?
            .set_default(
                "politeness_delay_range.min_ms",
                defaults.politeness_delay_range.min_ms,
            )?
            .set_default(
                "politeness_delay_range.max_ms",
                defaults.politeness_delay_range.max_ms,
            )?
            .set_default("page_ceiling", defaults.page_ceiling as u64)?
            .set_default("snapshot_every", defaults.snapshot_every)?
            .set_default("op_timeout_secs", defaults.op_timeout_secs)?
            .set_default("settle_delay_ms", defaults.settle_delay_ms)?
            .set_default("challenge_poll_ms", defaults.challenge_poll_ms)?
            .set_default("base_backoff_ms", defaults.base_backoff_ms)?
            .set_default("db_path", defaults.db_path.to_string_lossy().to_string())?
            .set_default(
                "snapshot_path",
                defaults.snapshot_path.to_string_lossy().to_string(),
            )?
            .set_default("store_raw_pages", defaults.store_raw_pages)?
            .set_default("user_agent", defaults.user_agent)?
            .add_source(config::File::with_name(CONFIG_FILE).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_concurrency", self.max_concurrency as u64),
            ("rate_per_minute", self.rate_per_minute as u64),
            ("challenge_timeout_iterations", self.challenge_timeout_iterations as u64),
            ("page_ceiling", self.page_ceiling as u64),
            ("snapshot_every", self.snapshot_every),
            ("op_timeout_secs", self.op_timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        let delay = self.politeness_delay_range;
        if delay.min_ms > delay.max_ms {
            return Err(ConfigError::Invalid {
                key: "politeness_delay_range",
                reason: format!("min {} exceeds max {}", delay.min_ms, delay.max_ms),
            });
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "db_path",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }

    pub fn politeness_delay(&self) -> RangeInclusive<Duration> {
        let d = self.politeness_delay_range;
        Duration::from_millis(d.min_ms)..=Duration::from_millis(d.max_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs)
    }

    /// Resolve the entry URL for a platform, preferring an explicit seed.
    pub fn seed_for(platform: Platform, seed: Option<&str>) -> Result<String, ConfigError> {
        seed.map(str::to_string)
            .or_else(|| platform.default_seed().map(str::to_string))
            .ok_or(ConfigError::MissingSeed(platform))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.rate_per_minute, 5);
        assert_eq!(s.snapshot_every, 50);
        assert_eq!(s.page_ceiling, 100);
    }

    #[test]
    fn rejects_zero_concurrency_and_inverted_delay() {
        let mut s = Settings::default();
        s.max_concurrency = 0;
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { key: "max_concurrency", .. })
        ));

        let mut s = Settings::default();
        s.politeness_delay_range = DelayRange { min_ms: 5, max_ms: 1 };
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { key: "politeness_delay_range", .. })
        ));
    }

    #[test]
    fn seed_resolution() {
        assert_eq!(
            Settings::seed_for(Platform::QPublic, None).unwrap(),
            "https://qpublic.schneidercorp.com"
        );
        assert_eq!(
            Settings::seed_for(Platform::Tyler, Some("https://hcad.org")).unwrap(),
            "https://hcad.org"
        );
        assert!(matches!(
            Settings::seed_for(Platform::Tyler, None),
            Err(ConfigError::MissingSeed(Platform::Tyler))
        ));
    }
}
