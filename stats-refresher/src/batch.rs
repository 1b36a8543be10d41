//! Batch refresh of stored connections.
//!
//! For every user with a connected profile, each connected provider is
//! brought up to date:
//!
//! ```text
//! bundle missing / provider not configured  -> skipped
//! assess == Expired                         -> soft error, nothing written
//! assess == NeedsRefresh                    -> refresh, store rotated bundle
//! then                                      -> fetch_profile, store profile
//! ```
//!
//! A failing pair is counted and logged; the run always moves on to the next
//! pair. Users are processed sequentially.

use anyhow::{Context, Result};
use linkstat::clock::Clock;
use linkstat::connectors::{ConnectorRegistry, Provider, TokenState};
use linkstat::credentials::CredentialStore;
use linkstat::profiles::ProfileStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one (user, provider) pair.
#[derive(Debug, PartialEq)]
enum Outcome {
    Updated,
    Skipped(&'static str),
    SoftError(&'static str),
}

/// One pair that was not updated.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshFailure {
    pub user_id: String,
    pub provider: Option<Provider>,
    pub reason: String,
    /// Expected condition (expired token) rather than a call failure
    pub soft: bool,
}

/// Counters for one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RefreshReport {
    pub users_scanned: usize,
    pub updated: usize,
    pub skipped: usize,
    pub soft_errors: usize,
    pub errors: usize,
    pub failures: Vec<RefreshFailure>,
}

pub struct BatchRefresher {
    connectors: ConnectorRegistry,
    credentials: Arc<CredentialStore>,
    profiles: Arc<ProfileStore>,
    clock: Arc<dyn Clock>,
}

impl BatchRefresher {
    pub fn new(
        connectors: ConnectorRegistry,
        credentials: Arc<CredentialStore>,
        profiles: Arc<ProfileStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            connectors,
            credentials,
            profiles,
            clock,
        }
    }

    /// Run one pass over all connected users.
    ///
    /// Only failing to enumerate users is fatal; per-pair failures end up in
    /// the report.
    pub async fn run_once(&self) -> Result<RefreshReport> {
        let started = self.clock.now();
        let users = self
            .profiles
            .list_connected_users()
            .context("Failed to list connected users")?;

        info!(users = users.len(), "Starting profile refresh");

        let mut report = RefreshReport::default();

        for user_id in users {
            report.users_scanned += 1;

            let profiles = match self.profiles.get_all(&user_id) {
                Ok(profiles) => profiles,
                Err(e) => {
                    error!(user_id = %user_id, error = %e, "Failed to load profiles");
                    report.errors += 1;
                    report.failures.push(RefreshFailure {
                        user_id: user_id.clone(),
                        provider: None,
                        reason: format!("{:#}", e),
                        soft: false,
                    });
                    continue;
                }
            };

            for (provider, _) in profiles.iter().filter(|(_, p)| p.connected) {
                let provider = *provider;
                match self.refresh_pair(&user_id, provider).await {
                    Ok(Outcome::Updated) => {
                        debug!(user_id = %user_id, provider = %provider, "Profile refreshed");
                        report.updated += 1;
                    }
                    Ok(Outcome::Skipped(reason)) => {
                        info!(user_id = %user_id, provider = %provider, reason, "Skipped");
                        report.skipped += 1;
                    }
                    Ok(Outcome::SoftError(reason)) => {
                        warn!(user_id = %user_id, provider = %provider, reason, "Connection needs the user");
                        report.soft_errors += 1;
                        report.failures.push(RefreshFailure {
                            user_id: user_id.clone(),
                            provider: Some(provider),
                            reason: reason.to_string(),
                            soft: true,
                        });
                    }
                    Err(e) => {
                        error!(user_id = %user_id, provider = %provider, error = %format!("{:#}", e), "Refresh failed");
                        report.errors += 1;
                        report.failures.push(RefreshFailure {
                            user_id: user_id.clone(),
                            provider: Some(provider),
                            reason: format!("{:#}", e),
                            soft: false,
                        });
                    }
                }
            }
        }

        let elapsed_ms = (self.clock.now() - started).num_milliseconds();
        info!(
            users_scanned = report.users_scanned,
            updated = report.updated,
            skipped = report.skipped,
            soft_errors = report.soft_errors,
            errors = report.errors,
            elapsed_ms,
            "Profile refresh finished"
        );

        Ok(report)
    }

    async fn refresh_pair(&self, user_id: &str, provider: Provider) -> Result<Outcome> {
        let Some(connector) = self.connectors.get(provider) else {
            return Ok(Outcome::Skipped("provider not configured"));
        };
        let Some(mut bundle) = self.credentials.get(user_id, provider)? else {
            return Ok(Outcome::Skipped("no token bundle"));
        };

        match connector.assess(&bundle, self.clock.now()) {
            TokenState::Current => {}
            TokenState::Expired => return Ok(Outcome::SoftError("token expired and cannot be refreshed")),
            TokenState::NeedsRefresh => {
                bundle = connector.refresh(&bundle).await?;
                // Stored before the profile fetch: rotated refresh tokens invalidate the old one
                self.credentials
                    .save(user_id, provider, &bundle)
                    .context("Failed to store refreshed token bundle")?;
                debug!(user_id = %user_id, provider = %provider, "Token refreshed");
            }
        }

        let profile = connector.fetch_profile(&bundle).await?;
        self.profiles
            .save(user_id, provider, &profile)
            .context("Failed to store profile")?;

        Ok(Outcome::Updated)
    }
}
