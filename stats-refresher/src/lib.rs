//! Scheduled refresh of connected social account statistics.

pub mod batch;
pub mod schedule;

pub use batch::{BatchRefresher, RefreshFailure, RefreshReport};
pub use schedule::{run_scheduled, RefreshSchedule};

use anyhow::{Context, Result};
use linkstat::config::AppConfig;

/// Check the settings the batch job depends on and build its schedule.
///
/// Runs before any store is opened, including for `--once`.
pub fn validate_config(config: &AppConfig) -> Result<RefreshSchedule> {
    config.validate_common()?;
    RefreshSchedule::new(&config.schedule.cron, &config.schedule.timezone)
        .context("Invalid [schedule] section")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        // No signing secret needed here
        assert!(validate_config(&AppConfig::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = AppConfig::default();
        config.http.timeout_seconds = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_schedule() {
        let mut config = AppConfig::default();
        config.schedule.cron = "daily".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{:#}", err).contains("schedule"));

        let mut config = AppConfig::default();
        config.schedule.timezone = "Mars/Olympus".to_string();
        assert!(validate_config(&config).is_err());
    }
}
