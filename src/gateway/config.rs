use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::profile::{Env, ProviderSettings};
use crate::tasks::TaskStoreConfig;
use crate::{ImagegenError, Result};

pub const LISTEN_ENV: &str = "IMAGEGEN_LISTEN";
pub const DEFAULT_PROVIDER_ENV: &str = "IMAGEGEN_DEFAULT_PROVIDER";

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_API_PREFIX: &str = "/api/image-generation";
pub const DEFAULT_PROVIDER: &str = "flux-kontext-pro";
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,
    #[serde(default = "default_provider")]
    pub default_provider: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub task_store: TaskStoreConfig,
    #[serde(default)]
    pub proxy_image: ProxyImageConfig,
    /// Keyed by provider type.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_api_prefix() -> String {
    DEFAULT_API_PREFIX.to_string()
}

fn default_provider() -> String {
    DEFAULT_PROVIDER.to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            api_prefix: default_api_prefix(),
            default_provider: default_provider(),
            max_body_bytes: default_max_body_bytes(),
            task_store: TaskStoreConfig::default(),
            proxy_image: ProxyImageConfig::default(),
            providers: BTreeMap::new(),
        }
    }
}

/// Which remote hosts `GET /proxy-image` may fetch from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyImageConfig {
    /// Hosts equal to, or ending in `.` plus, one of these suffixes are allowed.
    #[serde(default = "default_allowed_host_suffixes")]
    pub allowed_host_suffixes: Vec<String>,
    #[serde(default = "default_proxy_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_allowed_host_suffixes() -> Vec<String> {
    vec!["bfl.ai".to_string()]
}

fn default_proxy_timeout_secs() -> u64 {
    30
}

impl Default for ProxyImageConfig {
    fn default() -> Self {
        Self {
            allowed_host_suffixes: default_allowed_host_suffixes(),
            timeout_secs: default_proxy_timeout_secs(),
        }
    }
}

impl ProxyImageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn allows_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_host_suffixes.iter().any(|suffix| {
            let suffix = suffix.trim().trim_start_matches('.').to_ascii_lowercase();
            !suffix.is_empty()
                && (host == suffix
                    || host
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|prefix| prefix.ends_with('.')))
        })
    }
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config = toml::from_str::<Self>(raw)
            .map_err(|err| ImagegenError::InvalidConfig(format!("invalid config toml: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ImagegenError::InvalidConfig(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Env values win over the file.
    pub fn apply_env(&mut self, env: &Env) {
        if let Some(listen) = env.get(LISTEN_ENV) {
            self.listen = listen.trim().to_string();
        }
        if let Some(provider) = env.get(DEFAULT_PROVIDER_ENV) {
            self.default_provider = provider.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(ImagegenError::InvalidConfig(
                "listen must be non-empty".to_string(),
            ));
        }
        if self.default_provider.trim().is_empty() {
            return Err(ImagegenError::InvalidConfig(
                "default_provider must be non-empty".to_string(),
            ));
        }
        if !self.api_prefix.is_empty() && !self.api_prefix.starts_with('/') {
            return Err(ImagegenError::InvalidConfig(format!(
                "api_prefix must start with '/', got {:?}",
                self.api_prefix
            )));
        }
        if self.max_body_bytes == 0 {
            return Err(ImagegenError::InvalidConfig(
                "max_body_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for one provider type; absent sections mean all defaults.
    pub fn provider_settings(&self, provider_type: &str) -> ProviderSettings {
        self.providers
            .get(provider_type)
            .cloned()
            .unwrap_or_default()
    }

    /// The prefix with any trailing `/` removed; `""` mounts the api at the root.
    pub fn normalized_api_prefix(&self) -> &str {
        self.api_prefix.trim_end_matches('/')
    }
}
