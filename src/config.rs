use std::{path::PathBuf, time::Duration};

use chrono::{DateTime, Utc};

use crate::errors::ConfigError;

/// Non-secret runtime settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How often the scheduler runs the full task list.
    pub scheduler_interval: Duration,
    /// How long shutdown waits for an in-flight run.
    pub shutdown_grace: Duration,
    /// Pause between per-user Google Play lookups.
    pub google_poll_delay: Duration,
    /// Pause between per-user App Store lookups.
    pub apple_poll_delay: Duration,
    /// Send legacy receipts to the sandbox verifyReceipt endpoint first.
    pub apple_use_sandbox: bool,
    /// Where the in-memory store persists its snapshot, if anywhere.
    pub snapshot_path: Option<PathBuf>,
    /// Free users created before this instant qualify for the legacy bonus.
    pub legacy_bonus_cutoff: Option<DateTime<Utc>>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            scheduler_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(3000),
            google_poll_delay: Duration::from_millis(50),
            apple_poll_delay: Duration::from_millis(100),
            apple_use_sandbox: false,
            snapshot_path: None,
            legacy_bonus_cutoff: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            scheduler_interval: Duration::from_secs(
                parse_or("SCHEDULER_INTERVAL_SECS", defaults.scheduler_interval.as_secs())?,
            ),
            shutdown_grace: Duration::from_millis(parse_or(
                "SHUTDOWN_GRACE_MS",
                defaults.shutdown_grace.as_millis() as u64,
            )?),
            google_poll_delay: Duration::from_millis(parse_or(
                "GOOGLE_POLL_DELAY_MS",
                defaults.google_poll_delay.as_millis() as u64,
            )?),
            apple_poll_delay: Duration::from_millis(parse_or(
                "APPLE_POLL_DELAY_MS",
                defaults.apple_poll_delay.as_millis() as u64,
            )?),
            apple_use_sandbox: parse_or("APPLE_USE_SANDBOX", defaults.apple_use_sandbox)?,
            snapshot_path: std::env::var("LEDGER_SNAPSHOT_PATH").ok().map(PathBuf::from),
            legacy_bonus_cutoff: match std::env::var("LEGACY_BONUS_CUTOFF") {
                Ok(raw) => Some(
                    DateTime::parse_from_rfc3339(&raw)
                        .map_err(|e| ConfigError::Invalid {
                            key: "LEGACY_BONUS_CUTOFF",
                            message: e.to_string(),
                        })?
                        .with_timezone(&Utc),
                ),
                Err(_) => None,
            },
        })
    }

    /// Settings for tests and tools: no artificial delays.
    pub fn without_delays() -> Self {
        Self {
            google_poll_delay: Duration::ZERO,
            apple_poll_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}

fn parse_or<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
