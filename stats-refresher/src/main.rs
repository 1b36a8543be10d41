use anyhow::{Context, Result};
use linkstat::clock::system_clock;
use linkstat::config::AppConfig;
use linkstat::connectors::{build_http_client, ConnectorRegistry};
use linkstat::credentials::CredentialStore;
use linkstat::profiles::ProfileStore;
use stats_refresher::{run_scheduled, validate_config, BatchRefresher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stats_refresher=info,linkstat=info".into()),
        )
        .init();

    let run_once = std::env::args().skip(1).any(|arg| arg == "--once");

    info!(once = run_once, "Stats refresher starting...");

    let config_path = std::env::var("LINKSTAT_CONFIG").unwrap_or_else(|_| "linkstat.toml".to_string());
    let config = AppConfig::load(&config_path)?;
    let schedule = validate_config(&config).context("Refusing to start")?;

    let clock = system_clock();
    let http_client = build_http_client(Duration::from_secs(config.http.timeout_seconds))?;

    let credentials = Arc::new(
        CredentialStore::new(&config.storage.credentials_db)
            .context("Failed to initialize credential store")?,
    );
    let profiles = Arc::new(
        ProfileStore::new(&config.storage.profiles_db).context("Failed to initialize profile store")?,
    );

    let connectors = ConnectorRegistry::from_config(&config, http_client, clock.clone());
    if connectors.is_empty() {
        warn!("No provider has client credentials; every connection will be skipped");
    }

    let refresher = BatchRefresher::new(connectors, credentials, profiles, clock.clone());

    if run_once {
        let report = refresher.run_once().await?;
        for failure in &report.failures {
            warn!(
                user_id = %failure.user_id,
                provider = ?failure.provider,
                soft = failure.soft,
                reason = %failure.reason,
                "Not refreshed"
            );
        }
        return Ok(());
    }

    info!(
        cron = %config.schedule.cron,
        timezone = %config.schedule.timezone,
        "Refresh schedule loaded"
    );

    tokio::select! {
        result = run_scheduled(&refresher, &schedule, clock) => result,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl_c signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
    }
}
