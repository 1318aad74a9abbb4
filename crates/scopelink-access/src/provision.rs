//! Broker account provisioning.
//!
//! Keys issued under the provisioned policy double as broker passwords. The
//! broker admin API is reached through [`CredentialProvisioner`] so the gate can
//! be exercised without a live broker.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AccessError, Result};

/// Creates broker accounts for issued keys.
#[async_trait]
pub trait CredentialProvisioner: Send + Sync {
    /// Replace any account named `username` with one using `password`.
    async fn provision(&self, username: &str, password: &str) -> Result<()>;
}

/// Broker admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// API root, e.g. `https://broker.example.org/api/v5`
    pub base_url: String,
    /// Bearer token
    pub token: String,
    /// Role attached to provisioned accounts
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_role() -> String {
    "client".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl AdminConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            role: default_role(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Serialize)]
struct NewCredential<'a> {
    username: &'a str,
    password: &'a str,
}

/// HTTP client for the broker admin API.
pub struct BrokerAdminClient {
    config: AdminConfig,
    client: Client,
}

impl BrokerAdminClient {
    pub fn new(config: AdminConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| AccessError::Provisioning(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &AdminConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn credential_url(&self, username: &str) -> String {
        self.url(&format!("/mqtt/credentials/username/{}", username))
    }

    fn role_url(&self, username: &str) -> String {
        self.url(&format!(
            "/user/{}/roles/{}/attach",
            username, self.config.role
        ))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.config.token)
    }

    /// Delete the account; a missing account is not an error.
    pub async fn delete_credential(&self, username: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.credential_url(username))
            .header("Authorization", self.bearer())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("No broker account {} to delete", username);
            return Ok(());
        }
        check(status, response, "delete credential").await
    }

    pub async fn create_credential(&self, username: &str, password: &str) -> Result<()> {
        let response = self
            .client
            .post(self.url("/mqtt/credentials"))
            .header("Authorization", self.bearer())
            .json(&NewCredential { username, password })
            .send()
            .await?;

        let status = response.status();
        check(status, response, "create credential").await
    }

    pub async fn attach_role(&self, username: &str) -> Result<()> {
        let response = self
            .client
            .put(self.role_url(username))
            .header("Authorization", self.bearer())
            .send()
            .await?;

        let status = response.status();
        check(status, response, "attach role").await
    }
}

async fn check(status: StatusCode, response: reqwest::Response, action: &str) -> Result<()> {
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(AccessError::Provisioning(format!(
        "{} failed with {}: {}",
        action,
        status.as_u16(),
        body
    )))
}

#[async_trait]
impl CredentialProvisioner for BrokerAdminClient {
    async fn provision(&self, username: &str, password: &str) -> Result<()> {
        self.delete_credential(username).await?;
        self.create_credential(username, password).await?;
        self.attach_role(username).await?;
        info!("Provisioned broker account {}", username);
        Ok(())
    }
}
