use anyhow::{Context, Result};
use linkstat::api::{create_router, AppState};
use linkstat::auth::{IdentityToolkitVerifier, RequestAuthenticator};
use linkstat::clock::system_clock;
use linkstat::config::AppConfig;
use linkstat::connectors::{build_http_client, ConnectorRegistry};
use linkstat::credentials::CredentialStore;
use linkstat::profiles::ProfileStore;
use linkstat::signer::StateSigner;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Local development: pick up a .env file if there is one
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "linkstat=info".into()),
        )
        .init();

    info!("linkstat starting...");

    let config_path = std::env::var("LINKSTAT_CONFIG").unwrap_or_else(|_| "linkstat.toml".to_string());
    let config = AppConfig::load(&config_path)?;
    config.validate().context("Refusing to start")?;

    info!(
        bind_addr = %config.server.bind_addr,
        credentials_db = %config.storage.credentials_db,
        profiles_db = %config.storage.profiles_db,
        state_ttl_seconds = config.state.ttl_seconds,
        auth_enabled = config.auth.enabled,
        "Configuration loaded"
    );

    let clock = system_clock();
    let http_client = build_http_client(Duration::from_secs(config.http.timeout_seconds))?;

    let credentials = Arc::new(
        CredentialStore::new(&config.storage.credentials_db)
            .context("Failed to initialize credential store")?,
    );
    let profiles = Arc::new(
        ProfileStore::new(&config.storage.profiles_db).context("Failed to initialize profile store")?,
    );
    info!("Stores initialized");

    let connectors = ConnectorRegistry::from_config(&config, http_client.clone(), clock.clone());
    if connectors.is_empty() {
        warn!("No provider has client credentials; only /health and /profiles are served");
    }

    let verifier = Arc::new(IdentityToolkitVerifier::new(
        http_client,
        config.auth.lookup_url.clone(),
        config.auth.api_key.clone(),
    ));
    let authenticator = if config.auth.enabled {
        RequestAuthenticator::new(verifier)
    } else {
        warn!("Caller authentication is DISABLED; connect trusts the userId parameter");
        RequestAuthenticator::disabled(verifier)
    };

    let state = AppState {
        signer: Arc::new(StateSigner::new(
            config.state.signing_secret.as_bytes(),
            config.state.ttl_seconds,
            clock,
        )),
        authenticator,
        connectors,
        credentials,
        profiles,
    };

    let app = create_router(state).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_addr))?;
    info!(addr = %config.server.bind_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await
        .context("HTTP server error")?;

    Ok(())
}
