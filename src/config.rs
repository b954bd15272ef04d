//! Automation engine configuration.
//!
//! Loaded from TOML by the embedding backend; every field has a sane
//! default so an empty file (or no file) yields a working engine.

use crate::error::AutomationError;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default grace period after the billing due date, in days.
const DEFAULT_GRACE_PERIOD_DAYS: u32 = 3;

/// Quota percentage at which a warning alert is raised.
const DEFAULT_WARNING_THRESHOLD_PCT: f64 = 80.0;

/// Quota percentage at which a critical alert is raised.
const DEFAULT_CRITICAL_THRESHOLD_PCT: f64 = 100.0;

/// Rolling usage-history window in hours.
const DEFAULT_USAGE_HISTORY_HOURS: u32 = 24;

/// Default bandwidth sampling interval in seconds (5 minutes).
const DEFAULT_SAMPLE_INTERVAL_SECS: u64 = 300;

/// Automation log cap per subsystem (oldest evicted first).
const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Tunables for the lifecycle automation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Days past `next_billing_date` before an account counts as expired.
    pub grace_period_days: u32,
    /// Quota usage percentage that raises a warning alert.
    pub warning_threshold_pct: f64,
    /// Quota usage percentage that raises a critical alert.
    pub critical_threshold_pct: f64,
    /// How many hours of usage samples to retain per account.
    pub usage_history_hours: u32,
    /// Sampling interval used when the caller does not pass one.
    pub default_sample_interval_secs: u64,
    /// FIFO cap for each subsystem's automation log.
    pub log_capacity: usize,
    /// Default IANA timezone for accounts without an explicit one.
    pub timezone: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            grace_period_days: DEFAULT_GRACE_PERIOD_DAYS,
            warning_threshold_pct: DEFAULT_WARNING_THRESHOLD_PCT,
            critical_threshold_pct: DEFAULT_CRITICAL_THRESHOLD_PCT,
            usage_history_hours: DEFAULT_USAGE_HISTORY_HOURS,
            default_sample_interval_secs: DEFAULT_SAMPLE_INTERVAL_SECS,
            log_capacity: DEFAULT_LOG_CAPACITY,
            timezone: "Africa/Nairobi".into(),
        }
    }
}

impl AutomationConfig {
    /// Parse from a TOML string.
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw).context("invalid automation config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    /// Resolve the configured timezone.
    pub fn default_timezone(&self) -> Result<chrono_tz::Tz, AutomationError> {
        self.timezone
            .parse()
            .map_err(|_| AutomationError::UnknownTimezone(self.timezone.clone()))
    }

    /// Reject configs that would make the engine misbehave silently.
    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.critical_threshold_pct <= 0.0 {
            return Err(AutomationError::validation(
                "critical_threshold_pct must be positive",
            ));
        }
        if self.warning_threshold_pct >= self.critical_threshold_pct {
            return Err(AutomationError::validation(
                "warning_threshold_pct must be below critical_threshold_pct",
            ));
        }
        if self.usage_history_hours == 0 {
            return Err(AutomationError::validation(
                "usage_history_hours must be at least 1",
            ));
        }
        if self.default_sample_interval_secs == 0 {
            return Err(AutomationError::validation(
                "default_sample_interval_secs must be at least 1",
            ));
        }
        if self.log_capacity == 0 {
            return Err(AutomationError::validation(
                "log_capacity must be at least 1",
            ));
        }
        self.default_timezone()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AutomationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.grace_period_days, 3);
        assert_eq!(config.log_capacity, 1000);
        assert_eq!(config.default_timezone().unwrap(), chrono_tz::Africa::Nairobi);
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = AutomationConfig::from_toml_str("").unwrap();
        assert_eq!(config.usage_history_hours, 24);
    }

    #[test]
    fn partial_toml_overrides() {
        let config = AutomationConfig::from_toml_str(
            r#"
            grace_period_days = 7
            timezone = "Europe/Berlin"
            "#,
        )
        .unwrap();
        assert_eq!(config.grace_period_days, 7);
        assert_eq!(config.default_timezone().unwrap(), chrono_tz::Europe::Berlin);
        // Untouched fields keep their defaults.
        assert_eq!(config.warning_threshold_pct, 80.0);
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = AutomationConfig::from_toml_str(
            r#"
            warning_threshold_pct = 120.0
            critical_threshold_pct = 100.0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("warning_threshold_pct"));
    }

    #[test]
    fn rejects_unknown_timezone() {
        let err = AutomationConfig::from_toml_str(r#"timezone = "Mars/Olympus""#).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }
}
