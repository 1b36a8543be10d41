//! Connector registry.
//!
//! Holds one connector per configured provider. Providers without client
//! credentials are left out, so their routes are never registered.

use super::{InstagramConnector, Provider, ProviderConnector, TikTokConnector, YouTubeConnector};
use crate::clock::Clock;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<Provider, Arc<dyn ProviderConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build connectors for every provider with complete credentials.
    pub fn from_config(config: &AppConfig, client: reqwest::Client, clock: Arc<dyn Clock>) -> Self {
        let mut registry = Self::new();

        for provider in config.configured_providers() {
            let credentials = config.providers.get(provider).clone();
            let connector: Arc<dyn ProviderConnector> = match provider {
                Provider::YouTube => Arc::new(YouTubeConnector::new(credentials, client.clone(), clock.clone())),
                Provider::TikTok => Arc::new(TikTokConnector::new(credentials, client.clone(), clock.clone())),
                Provider::Instagram => {
                    Arc::new(InstagramConnector::new(credentials, client.clone(), clock.clone()))
                }
            };
            registry.insert(connector);
        }

        info!(providers = ?registry.providers(), "Registered provider connectors");
        registry
    }

    /// Register a connector, replacing any existing one for its provider.
    pub fn insert(&mut self, connector: Arc<dyn ProviderConnector>) {
        self.connectors.insert(connector.provider(), connector);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ProviderConnector>> {
        self.connectors.get(&provider).cloned()
    }

    /// Registered providers in a stable order.
    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.connectors.keys().copied().collect();
        providers.sort();
        providers
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}
