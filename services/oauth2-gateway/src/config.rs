//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Client secrets are loaded from `OAUTH2_<NAME>_CLIENT_SECRET` or a
//! `client_secret_file`, never from the TOML itself.

use common::Secret;
use oauth2_flow::{Endpoint, ProviderConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub pending: PendingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderSection>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally reachable base URL, used to build login and callback links
    pub public_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credential persistence. Without a path, credentials live in memory.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Login prompt delivery. Without a webhook, prompts are only logged.
#[derive(Debug, Default, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Lifetime of parked authentication requests
#[derive(Debug, Deserialize)]
pub struct PendingConfig {
    #[serde(default = "default_pending_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_pending_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl PendingConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// One `[[providers]]` entry
#[derive(Debug, Deserialize)]
pub struct ProviderSection {
    pub name: String,
    /// Overrides `server.public_url` for this provider's links
    #[serde(default)]
    pub url: Option<String>,
    pub client_id: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub auth_url: String,
    pub token_url: String,
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_pending_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    60
}

/// Env var holding a provider's client secret, e.g. `OAUTH2_GOOGLE_CLIENT_SECRET`.
pub fn secret_env_var(provider: &str) -> String {
    let name: String = provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("OAUTH2_{name}_CLIENT_SECRET")
}

impl Config {
    /// Load configuration from a TOML file, then resolve client secrets.
    ///
    /// Client secret resolution order per provider:
    /// 1. `OAUTH2_<NAME>_CLIENT_SECRET` env var
    /// 2. `client_secret_file` path from config
    ///
    /// A provider whose `client_secret_file` cannot be read is logged and
    /// dropped; the remaining providers are still loaded. Provider entries
    /// themselves are validated at registration.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.server.public_url.starts_with("http://")
            && !config.server.public_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "public_url must start with http:// or https://, got: {}",
                config.server.public_url
            )));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.pending.ttl_secs == 0 {
            return Err(common::Error::Config(
                "pending.ttl_secs must be greater than 0".into(),
            ));
        }

        if config.pending.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "pending.sweep_interval_secs must be greater than 0".into(),
            ));
        }

        config.providers.retain_mut(|provider| {
            if let Ok(secret) = std::env::var(secret_env_var(&provider.name)) {
                provider.client_secret = Some(Secret::new(secret));
            } else if let Some(ref secret_file) = provider.client_secret_file {
                let secret = match std::fs::read_to_string(secret_file) {
                    Ok(secret) => secret,
                    Err(e) => {
                        error!(
                            provider = %provider.name,
                            path = %secret_file.display(),
                            error = %e,
                            "failed to read client_secret_file, skipping oauth2 provider"
                        );
                        return false;
                    }
                };
                let secret = secret.trim().to_owned();
                if !secret.is_empty() {
                    provider.client_secret = Some(Secret::new(secret));
                }
            }
            true
        });

        Ok(config)
    }

    /// Provider settings ready for registration.
    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        self.providers
            .iter()
            .map(|p| ProviderConfig {
                name: p.name.clone(),
                url: p
                    .url
                    .clone()
                    .unwrap_or_else(|| self.server.public_url.clone()),
                client_id: p.client_id.clone(),
                client_secret: p.client_secret.clone().unwrap_or_default(),
                scopes: p.scopes.clone(),
                endpoint: Endpoint {
                    auth_url: p.auth_url.clone(),
                    token_url: p.token_url.clone(),
                },
            })
            .collect()
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth2-gateway.toml")
    }
}
