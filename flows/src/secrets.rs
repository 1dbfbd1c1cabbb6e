use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::error::FlowError;
use crate::error::FlowResult;

pub trait SecretStore: Send + Sync {
    fn get_secret(&self, name: &str) -> FlowResult<String>;
}

/// Reads secrets from environment variables named after the secret.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretStore;

impl SecretStore for EnvSecretStore {
    fn get_secret(&self, name: &str) -> FlowResult<String> {
        match std::env::var(name) {
            Ok(value) if !value.is_empty() => Ok(value),
            _ => Err(FlowError::MissingSecret(name.to_string())),
        }
    }
}

/// Fixed secrets, for tests and local runs.
#[derive(Debug, Default, Clone)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl SecretStore for StaticSecretStore {
    fn get_secret(&self, name: &str) -> FlowResult<String> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::MissingSecret(name.to_string()))
    }
}

/// The fields of a service account key the flows rely on.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountInfo {
    pub client_email: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Decodes a base64 encoded service account key, returning the raw JSON and
/// its parsed summary.
pub fn decode_service_account(
    name: &str,
    secret: &str,
) -> FlowResult<(String, ServiceAccountInfo)> {
    let bytes = STANDARD
        .decode(secret.trim())
        .map_err(|err| FlowError::invalid_secret(name, format!("not base64: {err}")))?;
    let json = String::from_utf8(bytes)
        .map_err(|err| FlowError::invalid_secret(name, format!("not UTF-8: {err}")))?;
    let info: ServiceAccountInfo = serde_json::from_str(&json).map_err(|err| {
        FlowError::invalid_secret(name, format!("not a service account key: {err}"))
    })?;
    Ok((json, info))
}
