//! Cron schedule in a fixed timezone.

use crate::batch::BatchRefresher;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use linkstat::clock::Clock;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info};

/// When the batch runs.
#[derive(Debug, Clone)]
pub struct RefreshSchedule {
    schedule: cron::Schedule,
    timezone: Tz,
}

impl RefreshSchedule {
    /// `expression` uses the six-field form (`sec min hour day month weekday`).
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let schedule = cron::Schedule::from_str(expression)
            .with_context(|| format!("Invalid cron expression '{}'", expression))?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| anyhow!("Invalid timezone '{}': {}", timezone, e))?;
        Ok(Self { schedule, timezone })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Sleep until each fire time and run the batch. Never returns unless the
/// schedule runs out of fire times.
pub async fn run_scheduled(
    refresher: &BatchRefresher,
    schedule: &RefreshSchedule,
    clock: Arc<dyn Clock>,
) -> Result<()> {
    loop {
        let now = clock.now();
        let next = schedule
            .next_after(now)
            .context("Schedule has no upcoming fire time")?;
        let wait = (next - now).to_std().unwrap_or_default();

        info!(next_run = %next, wait_secs = wait.as_secs(), "Waiting for next profile refresh");
        tokio::time::sleep(wait).await;

        if let Err(e) = refresher.run_once().await {
            error!(error = %format!("{:#}", e), "Profile refresh aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_run_in_winter() {
        let schedule = RefreshSchedule::new("0 0 2 * * *", "Europe/Paris").unwrap();
        // 01:30 in Paris (UTC+1)
        let next = schedule.next_after(at("2024-01-15T00:30:00Z")).unwrap();
        assert_eq!(next, at("2024-01-15T01:00:00Z"));
    }

    #[test]
    fn test_daily_run_in_summer() {
        let schedule = RefreshSchedule::new("0 0 2 * * *", "Europe/Paris").unwrap();
        // 02:30 in Paris (UTC+2): today's run already happened
        let next = schedule.next_after(at("2024-07-15T00:30:00Z")).unwrap();
        assert_eq!(next, at("2024-07-16T00:00:00Z"));
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = RefreshSchedule::new("0 0 2 * * *", "UTC").unwrap();
        let next = schedule.next_after(at("2024-01-15T02:00:00Z")).unwrap();
        assert_eq!(next, at("2024-01-16T02:00:00Z"));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(RefreshSchedule::new("every day", "Europe/Paris").is_err());
        assert!(RefreshSchedule::new("0 0 2 * * *", "Mars/Olympus").is_err());
    }
}
