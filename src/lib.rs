// Configuration and time source
pub mod clock;
pub mod config;

// OAuth state signing and caller authentication
pub mod auth;
pub mod signer;

// Provider connectors
pub mod connectors;

// Token and profile storage
pub mod credentials;
pub mod profiles;

// HTTP API
pub mod api;
