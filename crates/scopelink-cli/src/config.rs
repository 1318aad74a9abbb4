//! Settings resolved from the environment.

use std::path::PathBuf;

use scopelink_access::AdminConfig;
use scopelink_transport::TransportConfig;

/// Environment variable names.
pub mod env_vars {
    pub const BROKER_HOST: &str = "SCOPELINK_BROKER_HOST";
    pub const BROKER_PORT: &str = "SCOPELINK_BROKER_PORT";
    pub const MQTT_USERNAME: &str = "SCOPELINK_MQTT_USERNAME";
    pub const MQTT_PASSWORD: &str = "SCOPELINK_MQTT_PASSWORD";
    pub const CA_FILE: &str = "SCOPELINK_CA_FILE";
    pub const KEY_STORE: &str = "SCOPELINK_KEY_STORE";
    pub const ADMIN_URL: &str = "SCOPELINK_ADMIN_URL";
    pub const ADMIN_TOKEN: &str = "SCOPELINK_ADMIN_TOKEN";
    pub const STITCH_TOOL: &str = "SCOPELINK_STITCH_TOOL";
    pub const LOG_JSON: &str = "SCOPELINK_LOG_JSON";
}

pub const DEFAULT_BROKER_PORT: u16 = 8883;
pub const DEFAULT_KEY_STORE: &str = "data/keys.redb";

/// Everything the binary reads from its environment.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub key_store: Option<PathBuf>,
    pub admin_url: Option<String>,
    pub admin_token: Option<String>,
    pub stitch_tool: Option<PathBuf>,
    pub log_json: bool,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve settings through `lookup`; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let broker_port = match get(env_vars::BROKER_PORT) {
            Some(port) => Some(port.trim().parse::<u16>().map_err(|e| {
                anyhow::anyhow!("{} is not a valid port: {}", env_vars::BROKER_PORT, e)
            })?),
            None => None,
        };

        Ok(Self {
            broker_host: get(env_vars::BROKER_HOST),
            broker_port,
            mqtt_username: get(env_vars::MQTT_USERNAME),
            mqtt_password: get(env_vars::MQTT_PASSWORD),
            ca_file: get(env_vars::CA_FILE).map(PathBuf::from),
            key_store: get(env_vars::KEY_STORE).map(PathBuf::from),
            admin_url: get(env_vars::ADMIN_URL),
            admin_token: get(env_vars::ADMIN_TOKEN),
            stitch_tool: get(env_vars::STITCH_TOOL).map(PathBuf::from),
            log_json: get(env_vars::LOG_JSON)
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    /// Broker admin settings, when both URL and token are present.
    pub fn admin(&self) -> Option<AdminConfig> {
        match (&self.admin_url, &self.admin_token) {
            (Some(url), Some(token)) => Some(AdminConfig::new(url.clone(), token.clone())),
            _ => None,
        }
    }

    pub fn key_store_path(&self) -> PathBuf {
        self.key_store
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_STORE))
    }

    /// Broker connection without credentials.
    pub fn transport(&self) -> anyhow::Result<TransportConfig> {
        let host = self.broker_host.clone().ok_or_else(|| {
            anyhow::anyhow!(
                "No broker host: pass --broker-host or set {}",
                env_vars::BROKER_HOST
            )
        })?;

        let mut config =
            TransportConfig::new(host).with_port(self.broker_port.unwrap_or(DEFAULT_BROKER_PORT));
        if let Some(ca_file) = &self.ca_file {
            config = config.with_ca_file(ca_file.clone());
        }
        Ok(config)
    }
}
