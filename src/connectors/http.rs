//! Shared HTTP plumbing for provider calls.
//!
//! Every outbound call goes through a client with a bounded timeout. Timeouts
//! surface as their own error; everything else becomes a message with the
//! provider's error detail and no token strings.

use super::ProviderError;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Longest provider error body kept in a message
const MAX_ERROR_DETAIL: usize = 300;

/// Build the HTTP client used for all provider calls.
pub fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent("linkstat/0.1")
        .timeout(timeout)
        .build()
        .context("Failed to build HTTP client")
}

/// Outcome of one failed call, before it is attributed to an operation.
#[derive(Debug)]
pub(crate) enum CallError {
    Timeout,
    Failed(String),
}

impl CallError {
    /// Attribute the failure to `operation`, using `kind` for non-timeouts.
    pub(crate) fn into_provider_error(
        self,
        operation: &str,
        kind: fn(String) -> ProviderError,
    ) -> ProviderError {
        match self {
            CallError::Timeout => ProviderError::Timeout(operation.to_string()),
            CallError::Failed(detail) => kind(format!("{}: {}", operation, detail)),
        }
    }
}

/// Thin wrapper over a shared `reqwest::Client`.
#[derive(Clone)]
pub struct ProviderHttp {
    client: Client,
}

impl ProviderHttp {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` and decode a JSON body.
    ///
    /// Non-2xx responses fail with the status and the provider's error
    /// detail. `secrets` are scrubbed from every message.
    pub(crate) async fn send_json(
        &self,
        request: RequestBuilder,
        secrets: &[&str],
    ) -> Result<Value, CallError> {
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport_error(e, secrets))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, secrets))?;

        if !status.is_success() {
            let detail = error_detail(&body);
            return Err(CallError::Failed(redact(
                &format!("status {}: {}", status, detail),
                secrets,
            )));
        }

        serde_json::from_str(&body)
            .map_err(|e| CallError::Failed(format!("invalid JSON response: {}", e)))
    }
}

/// Decode an already-parsed body into a typed response.
pub(crate) fn decode<T: DeserializeOwned>(json: Value) -> Result<T, CallError> {
    serde_json::from_value(json)
        .map_err(|e| CallError::Failed(format!("unexpected response shape: {}", e)))
}

fn transport_error(err: reqwest::Error, secrets: &[&str]) -> CallError {
    if err.is_timeout() {
        CallError::Timeout
    } else {
        CallError::Failed(redact(&format!("request failed: {}", err), secrets))
    }
}

/// Pull the most useful error text out of a provider error body.
///
/// Understands `error_description`, `error.message`, `error` (string) and
/// `message`; falls back to the raw (truncated) body.
pub(crate) fn error_detail(body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| provider_error_message(&json))
        .unwrap_or_else(|| body.trim().to_string());
    truncate(&detail, MAX_ERROR_DETAIL)
}

/// Error text from a decoded provider payload, if it reports one.
pub(crate) fn provider_error_message(json: &Value) -> Option<String> {
    if let Some(desc) = json.get("error_description").and_then(Value::as_str) {
        let code = json.get("error").and_then(Value::as_str).unwrap_or("error");
        return Some(format!("{} ({})", desc, code));
    }
    match json.get("error") {
        Some(Value::String(code)) if !code.is_empty() => return Some(code.clone()),
        Some(Value::Object(obj)) => {
            if let Some(message) = obj.get("message").and_then(Value::as_str) {
                if !message.is_empty() {
                    return Some(message.to_string());
                }
            }
        }
        _ => {}
    }
    json.get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/// Replace every non-empty secret in `message`.
pub fn redact(message: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(message.to_string(), |acc, secret| acc.replace(secret, "[REDACTED]"))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

/// Expiry instant `expires_in` seconds after `now`.
///
/// Negative or out-of-range lifetimes are rejected rather than clamped.
pub(crate) fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> Result<DateTime<Utc>, CallError> {
    if expires_in < 0 {
        return Err(CallError::Failed(format!("invalid expires_in: {}", expires_in)));
    }
    chrono::Duration::try_seconds(expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| CallError::Failed(format!("invalid expires_in: {}", expires_in)))
}

/// Non-negative counter from a number or a decimal string; 0 otherwise.
pub(crate) fn count(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
