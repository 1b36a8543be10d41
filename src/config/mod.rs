//! Process configuration.
//!
//! Loaded once at startup from an optional TOML file, overlaid with
//! `LINKSTAT_*` environment variables, validated, then shared read-only.

use crate::connectors::Provider;
use crate::signer::DEFAULT_STATE_TTL_SECONDS;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Minimum accepted length of the state signing secret, in bytes.
pub const MIN_SIGNING_SECRET_LEN: usize = 16;

/// Complete linkstat configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

/// OAuth state token settings
#[derive(Clone, Deserialize)]
pub struct StateConfig {
    /// HMAC key for state tokens. Required.
    #[serde(default)]
    pub signing_secret: String,
    /// How long a state token stays valid (seconds)
    #[serde(default = "default_state_ttl")]
    pub ttl_seconds: i64,
}

fn default_state_ttl() -> i64 {
    DEFAULT_STATE_TTL_SECONDS
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            ttl_seconds: default_state_ttl(),
        }
    }
}

impl std::fmt::Debug for StateConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateConfig")
            .field("signing_secret", &redacted(&self.signing_secret))
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

/// Identity assertion checks on the connect step
#[derive(Clone, Deserialize)]
pub struct AuthConfig {
    /// When false, the `userId` query parameter is trusted as-is (local development only)
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    /// Account lookup endpoint that resolves an ID token to its subject
    #[serde(default = "default_lookup_url")]
    pub lookup_url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_auth_enabled() -> bool {
    true
}

fn default_lookup_url() -> String {
    "https://identitytoolkit.googleapis.com/v1/accounts:lookup".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            lookup_url: default_lookup_url(),
            api_key: String::new(),
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("enabled", &self.enabled)
            .field("lookup_url", &self.lookup_url)
            .field("api_key", &redacted(&self.api_key))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credentials_db")]
    pub credentials_db: String,
    #[serde(default = "default_profiles_db")]
    pub profiles_db: String,
}

fn default_credentials_db() -> String {
    "credentials.db".to_string()
}

fn default_profiles_db() -> String {
    "profiles.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credentials_db: default_credentials_db(),
            profiles_db: default_profiles_db(),
        }
    }
}

/// Outbound provider HTTP settings
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    15
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
        }
    }
}

/// Batch refresh schedule
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Cron expression with a seconds field (daily at 02:00 by default)
    #[serde(default = "default_cron")]
    pub cron: String,
    /// IANA timezone the cron expression is evaluated in
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_cron() -> String {
    "0 0 2 * * *".to_string()
}

fn default_timezone() -> String {
    "Europe/Paris".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            timezone: default_timezone(),
        }
    }
}

/// OAuth client registration for one provider
#[derive(Clone, Default, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uri: String,
}

impl ProviderCredentials {
    /// All three values are present.
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty() && !self.redirect_uri.is_empty()
    }
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &redacted(&self.client_secret))
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub youtube: ProviderCredentials,
    #[serde(default)]
    pub tiktok: ProviderCredentials,
    #[serde(default)]
    pub instagram: ProviderCredentials,
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderCredentials {
        match provider {
            Provider::YouTube => &self.youtube,
            Provider::TikTok => &self.tiktok,
            Provider::Instagram => &self.instagram,
        }
    }

    fn get_mut(&mut self, provider: Provider) -> &mut ProviderCredentials {
        match provider {
            Provider::YouTube => &mut self.youtube,
            Provider::TikTok => &mut self.tiktok,
            Provider::Instagram => &mut self.instagram,
        }
    }
}

impl AppConfig {
    /// Load from `path` if it exists and apply environment overrides.
    ///
    /// The server must still call [`AppConfig::validate`]. The batch job only
    /// needs [`AppConfig::validate_common`]; it has no signing secret.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            load_config(path)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay values from the environment. `lookup` is injectable for tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set_string = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key) {
                *target = v;
            }
        };

        set_string(&mut self.server.bind_addr, "LINKSTAT_BIND_ADDR");
        set_string(&mut self.state.signing_secret, "LINKSTAT_SIGNING_SECRET");
        set_string(&mut self.auth.lookup_url, "LINKSTAT_AUTH_LOOKUP_URL");
        set_string(&mut self.auth.api_key, "LINKSTAT_AUTH_API_KEY");
        set_string(&mut self.storage.credentials_db, "LINKSTAT_CREDENTIALS_DB");
        set_string(&mut self.storage.profiles_db, "LINKSTAT_PROFILES_DB");
        set_string(&mut self.schedule.cron, "LINKSTAT_SCHEDULE_CRON");
        set_string(&mut self.schedule.timezone, "LINKSTAT_SCHEDULE_TIMEZONE");

        if let Some(v) = lookup("LINKSTAT_STATE_TTL_SECONDS") {
            if let Ok(n) = v.parse::<i64>() {
                self.state.ttl_seconds = n;
            }
        }
        if let Some(v) = lookup("LINKSTAT_AUTH_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.auth.enabled = b;
            }
        }
        if let Some(v) = lookup("LINKSTAT_HTTP_TIMEOUT_SECONDS") {
            if let Ok(n) = v.parse::<u64>() {
                self.http.timeout_seconds = n;
            }
        }

        for provider in Provider::ALL {
            let prefix = format!("LINKSTAT_{}", provider.as_str().to_uppercase());
            let creds = self.providers.get_mut(provider);
            set_string(&mut creds.client_id, &format!("{}_CLIENT_ID", prefix));
            set_string(&mut creds.client_secret, &format!("{}_CLIENT_SECRET", prefix));
            set_string(&mut creds.redirect_uri, &format!("{}_REDIRECT_URI", prefix));
        }
    }

    /// Checks shared by the server and the batch job.
    pub fn validate_common(&self) -> Result<()> {
        if self.http.timeout_seconds == 0 {
            bail!("http timeout_seconds must be positive");
        }
        Ok(())
    }

    /// Server checks. Refuses to start without a usable signing secret.
    pub fn validate(&self) -> Result<()> {
        self.validate_common()?;
        if self.state.signing_secret.is_empty() {
            bail!("LINKSTAT_SIGNING_SECRET is required");
        }
        if self.state.signing_secret.len() < MIN_SIGNING_SECRET_LEN {
            bail!(
                "signing secret must be at least {} bytes",
                MIN_SIGNING_SECRET_LEN
            );
        }
        if self.state.ttl_seconds <= 0 {
            bail!("state ttl_seconds must be positive");
        }
        if self.auth.enabled && self.auth.api_key.is_empty() {
            bail!("LINKSTAT_AUTH_API_KEY is required when auth is enabled");
        }
        Ok(())
    }

    /// Providers with a complete client registration.
    pub fn configured_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|p| self.providers.get(*p).is_complete())
            .collect()
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: AppConfig =
        toml::from_str(&contents).with_context(|| format!("Failed to parse {}", path))?;
    Ok(config)
}

fn redacted(value: &str) -> &'static str {
    if value.is_empty() {
        "<unset>"
    } else {
        "<redacted>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.state.ttl_seconds, 600);
        assert!(config.auth.enabled);
        assert_eq!(config.http.timeout_seconds, 15);
        assert_eq!(config.schedule.cron, "0 0 2 * * *");
        assert_eq!(config.schedule.timezone, "Europe/Paris");
        assert!(config.configured_providers().is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:8080"

            [state]
            signing_secret = "0123456789abcdef0123"
            ttl_seconds = 300

            [auth]
            enabled = false

            [providers.youtube]
            client_id = "yt-id"
            client_secret = "yt-secret"
            redirect_uri = "https://example.com/youtube_callback"

            [providers.tiktok]
            client_id = "tt-key"
        "#;

        let config: AppConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.state.ttl_seconds, 300);
        assert!(!config.auth.enabled);
        assert_eq!(config.providers.youtube.client_id, "yt-id");
        // TikTok registration is incomplete, so only YouTube is configured
        assert_eq!(config.configured_providers(), vec![Provider::YouTube]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env(env(&[
            ("LINKSTAT_SIGNING_SECRET", "a-very-long-signing-secret"),
            ("LINKSTAT_STATE_TTL_SECONDS", "120"),
            ("LINKSTAT_AUTH_ENABLED", "false"),
            ("LINKSTAT_INSTAGRAM_CLIENT_ID", "ig-id"),
            ("LINKSTAT_INSTAGRAM_CLIENT_SECRET", "ig-secret"),
            ("LINKSTAT_INSTAGRAM_REDIRECT_URI", "https://example.com/instagram_callback"),
            ("LINKSTAT_HTTP_TIMEOUT_SECONDS", "not-a-number"),
        ]));

        assert_eq!(config.state.signing_secret, "a-very-long-signing-secret");
        assert_eq!(config.state.ttl_seconds, 120);
        assert!(!config.auth.enabled);
        // Unparseable values keep the default
        assert_eq!(config.http.timeout_seconds, 15);
        assert_eq!(config.configured_providers(), vec![Provider::Instagram]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_signing_secret_rejected() {
        let mut config = AppConfig::default();
        config.auth.enabled = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("SIGNING_SECRET"));

        config.state.signing_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_auth_requires_api_key() {
        let mut config = AppConfig::default();
        config.state.signing_secret = "0123456789abcdef0123".to_string();
        assert!(config.validate().is_err());

        config.auth.api_key = "key".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_http_timeout_rejected() {
        let mut config = AppConfig::default();
        config.state.signing_secret = "0123456789abcdef0123".to_string();
        config.auth.api_key = "key".to_string();
        config.http.timeout_seconds = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_seconds"));
        assert!(config.validate_common().is_err());

        config.http.timeout_seconds = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.state.signing_secret = "super-secret-signing-key".to_string();
        config.providers.tiktok.client_secret = "tiktok-secret".to_string();

        let debug = format!("{:?}", config);
        assert!(!debug.contains("super-secret-signing-key"));
        assert!(!debug.contains("tiktok-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
