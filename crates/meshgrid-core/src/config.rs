//! Heal element configuration.
//!
//! Parsed from TOML. Durations are strings such as `"500ms"`, `"5s"`,
//! `"2m"`, or a bare number of seconds.
//!
//! ```toml
//! resubscribe_backoff = "100ms"
//! heal_timeout = "15s"
//!
//! [retry]
//! max_attempts = 3
//! initial_backoff = "1s"
//! max_backoff = "60s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Raw TOML representation. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HealConfigFile {
    resubscribe_backoff: Option<String>,
    heal_timeout: Option<String>,
    retry: Option<RetryConfigFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RetryConfigFile {
    max_attempts: Option<u32>,
    initial_backoff: Option<String>,
    max_backoff: Option<String>,
}

/// Retry policy applied to one heal trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per trigger. `1` means no retry.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// No retries: a failed heal is dropped until the next trigger.
    pub fn none() -> Self {
        Self::default()
    }

    /// Retry up to `max_attempts` times with doubling backoff.
    pub fn exponential(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }
}

/// Runtime configuration of the heal element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealConfig {
    /// Fixed delay between monitoring subscription attempts.
    pub resubscribe_backoff: Duration,
    /// Upper bound on a single forwarded heal request.
    pub heal_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            resubscribe_backoff: Duration::from_millis(100),
            heal_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

impl HealConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let file: HealConfigFile = toml::from_str(s)?;
        let defaults = Self::default();
        let retry_file = file.retry.unwrap_or_default();

        let config = Self {
            resubscribe_backoff: duration_field(
                "resubscribe_backoff",
                file.resubscribe_backoff.as_deref(),
                defaults.resubscribe_backoff,
            )?,
            heal_timeout: duration_field(
                "heal_timeout",
                file.heal_timeout.as_deref(),
                defaults.heal_timeout,
            )?,
            retry: RetryPolicy {
                max_attempts: retry_file
                    .max_attempts
                    .unwrap_or(defaults.retry.max_attempts),
                initial_backoff: duration_field(
                    "retry.initial_backoff",
                    retry_file.initial_backoff.as_deref(),
                    defaults.retry.initial_backoff,
                )?,
                max_backoff: duration_field(
                    "retry.max_backoff",
                    retry_file.max_backoff.as_deref(),
                    defaults.retry.max_backoff,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(ConfigError::Invalid(format!(
                "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
                self.retry.initial_backoff, self.retry.max_backoff
            )));
        }
        if self.heal_timeout.is_zero() {
            return Err(ConfigError::Invalid("heal_timeout must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Builder method: set the resubscription delay.
    pub fn with_resubscribe_backoff(self, resubscribe_backoff: Duration) -> Self {
        Self {
            resubscribe_backoff,
            ..self
        }
    }

    /// Builder method: set the per-attempt heal timeout.
    pub fn with_heal_timeout(self, heal_timeout: Duration) -> Self {
        Self {
            heal_timeout,
            ..self
        }
    }

    /// Builder method: set the retry policy.
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }
}

fn duration_field(
    name: &str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => parse_duration(raw)
            .ok_or_else(|| ConfigError::Invalid(format!("{name}: invalid duration {raw:?}"))),
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
