use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Deployment settings for one provider type (`[providers.<type>]` in the config file).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Env keys searched for the api key, in order. Empty means the provider defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_key_env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_safety_filters: Option<bool>,
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key_env", &self.api_key_env)
            .field("timeout_secs", &self.timeout_secs)
            .field("http_headers", &"<redacted>")
            .field("disable_safety_filters", &self.disable_safety_filters)
            .finish()
    }
}

impl ProviderSettings {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}
