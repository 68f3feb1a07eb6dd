//! Bearer credentials presented to the relay on connect and on every
//! keep-alive.

use crate::core::config::data::RelayConfig;
use async_trait::async_trait;
use keyring::Entry;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const KEYRING_SERVICE: &str = "mcp-hub-relay";
pub const TOKEN_ENV_VAR: &str = "MCP_HUB_RELAY_TOKEN";

const TOKEN_CONNECT_TIMEOUT_SECONDS: u64 = 10;
const TOKEN_REQUEST_TIMEOUT_SECONDS: u64 = 30;

/// Failures when accessing the platform keyring.
///
/// Recoverable errors mean the backend was temporarily unavailable (for
/// example a locked keychain).
#[derive(Debug, Error)]
pub enum KeyringAccessError {
    #[error("{0}")]
    Recoverable(#[source] keyring::Error),
    #[error("{0}")]
    Permanent(#[source] keyring::Error),
}

impl KeyringAccessError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KeyringAccessError::Recoverable(_))
    }
}

impl From<keyring::Error> for KeyringAccessError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                KeyringAccessError::Recoverable(err)
            }
            other => KeyringAccessError::Permanent(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no relay token is configured")]
    Missing,
    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token endpoint returned HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("token endpoint returned an empty token")]
    Empty,
    #[error("keyring access failed: {0}")]
    Keyring(#[from] KeyringAccessError),
}

#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Current bearer token. Called again for every keep-alive so rotating
    /// sources can hand out fresh values.
    async fn token(&self) -> Result<String, CredentialError>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl CredentialSource for StaticToken {
    async fn token(&self) -> Result<String, CredentialError> {
        if self.0.trim().is_empty() {
            return Err(CredentialError::Missing);
        }
        Ok(self.0.clone())
    }
}

/// Fetches a token from an HTTP endpoint on every call.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: reqwest::Client,
    url: String,
}

impl HttpTokenSource {
    pub fn new(url: impl Into<String>) -> Result<Self, CredentialError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(TOKEN_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_secs(TOKEN_REQUEST_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CredentialSource for HttpTokenSource {
    async fn token(&self) -> Result<String, CredentialError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CredentialError::Status(status));
        }
        let body = response.text().await?;
        parse_token_body(&body).ok_or(CredentialError::Empty)
    }
}

/// Accepts `{"token": ..}`, `{"access_token": ..}`, a JSON string, or plain
/// text.
fn parse_token_body(body: &str) -> Option<String> {
    let token = match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Object(map)) => ["token", "access_token", "accessToken"]
            .iter()
            .find_map(|key| map.get(*key).and_then(|value| value.as_str()))
            .map(str::to_string),
        Ok(serde_json::Value::String(text)) => Some(text),
        _ => Some(body.to_string()),
    }?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Reads the token stored under [`KEYRING_SERVICE`] for one account.
#[derive(Debug, Clone)]
pub struct KeyringCredentials {
    account: String,
}

impl KeyringCredentials {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
        }
    }

    pub fn store(&self, token: &str) -> Result<(), KeyringAccessError> {
        let entry = Entry::new(KEYRING_SERVICE, &self.account)?;
        entry.set_password(token).map_err(KeyringAccessError::from)
    }
}

#[async_trait]
impl CredentialSource for KeyringCredentials {
    async fn token(&self) -> Result<String, CredentialError> {
        let account = self.account.clone();
        let lookup = tokio::task::spawn_blocking(move || {
            let entry = Entry::new(KEYRING_SERVICE, &account)?;
            match entry.get_password() {
                Ok(token) => Ok(Some(token)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(err) => Err(KeyringAccessError::from(err)),
            }
        })
        .await
        .map_err(|_| CredentialError::Missing)?;
        lookup?.ok_or(CredentialError::Missing)
    }
}

/// Picks a source for `relay`: an explicit token first, then the config
/// token, then the token endpoint, then the keyring entry named after the
/// relay URL.
pub fn credential_source(
    relay: &RelayConfig,
    explicit_token: Option<String>,
) -> Result<Arc<dyn CredentialSource>, CredentialError> {
    if let Some(token) = explicit_token.or_else(|| relay.token.clone()) {
        return Ok(Arc::new(StaticToken::new(token)));
    }
    if let Some(url) = &relay.token_url {
        return Ok(Arc::new(HttpTokenSource::new(url.clone())?));
    }
    let account = relay.url.clone().unwrap_or_else(|| "default".to_string());
    Ok(Arc::new(KeyringCredentials::new(account)))
}
