use crate::error::{missing_field_path, to_env_var, ConfigError};
use blockflow::providers::configs::ProviderConfigs;
use blockflow::proxy::ProxyConfig;
use blockflow::vault::{CredentialVault, Secret};
use config::{Config, Environment};
use serde::Deserialize;
use std::fmt;
use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }
}

#[derive(Default, Deserialize)]
pub struct VaultSettings {
    /// Base64 of the 32 byte AES-256-GCM key
    pub key: Option<String>,
}

impl fmt::Debug for VaultSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSettings")
            .field("key", &self.key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxySettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_retry_delay_secs: u64,
    #[serde(default = "default_base_retry_delay_ms")]
    pub base_retry_delay_ms: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            max_retry_delay_secs: default_max_retry_delay_secs(),
            base_retry_delay_ms: default_base_retry_delay_ms(),
        }
    }
}

#[derive(Default, Deserialize)]
pub struct WebhookSettings {
    pub secret: Option<String>,
}

impl fmt::Debug for WebhookSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookSettings")
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
pub struct ContextSettings {
    #[serde(default = "default_budget_chars")]
    pub default_budget_chars: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            default_budget_chars: default_budget_chars(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub vault: VaultSettings,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub providers: ProviderConfigs,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub context: ContextSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        Self::load_and_validate()
    }

    fn load_and_validate() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("context.default_budget_chars", default_budget_chars() as u64)?
            .add_source(
                Environment::with_prefix("BLOCKFLOW")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = match config.try_deserialize() {
            Ok(settings) => settings,
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);
                let message = err.to_string();
                if let Some(field) = missing_field_path(&message) {
                    return Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(&field),
                    });
                }
                if let config::ConfigError::NotFound(field) = &err {
                    return Err(ConfigError::MissingEnvVar {
                        env_var: to_env_var(field),
                    });
                }
                return Err(ConfigError::Other(err));
            }
        };

        // Both secrets are required, checked here so the error names the variable
        settings.vault()?;
        settings.webhook_secret()?;
        Ok(settings)
    }

    pub fn vault(&self) -> Result<CredentialVault, ConfigError> {
        let key = required(self.vault.key.as_deref(), "vault.key")?;
        CredentialVault::from_base64(key).map_err(|err| ConfigError::InvalidValue {
            env_var: to_env_var("vault.key"),
            reason: err.to_string(),
        })
    }

    pub fn webhook_secret(&self) -> Result<Secret, ConfigError> {
        required(self.webhook.secret.as_deref(), "webhook.secret").map(Secret::new)
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            request_timeout: Duration::from_secs(self.proxy.request_timeout_secs),
            stream_idle_timeout: Duration::from_secs(self.proxy.stream_idle_timeout_secs),
            max_retry_delay: Duration::from_secs(self.proxy.max_retry_delay_secs),
            base_retry_delay: Duration::from_millis(self.proxy.base_retry_delay_ms),
            providers: self.providers.clone(),
        }
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str, ConfigError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingEnvVar {
            env_var: to_env_var(field),
        }),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_stream_idle_timeout_secs() -> u64 {
    30
}

fn default_max_retry_delay_secs() -> u64 {
    10
}

fn default_base_retry_delay_ms() -> u64 {
    500
}

fn default_budget_chars() -> usize {
    24_000
}
