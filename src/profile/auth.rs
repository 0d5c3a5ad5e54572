use reqwest::header::{HeaderName, HeaderValue};

use crate::{ImagegenError, Result};

use super::env::Env;

/// A static credential header attached to every outbound call.
#[derive(Clone)]
pub(crate) struct HttpAuth {
    pub(crate) header: HeaderName,
    pub(crate) value: HeaderValue,
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAuth")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl HttpAuth {
    pub(crate) fn header_value(header: &str, token: &str) -> Result<Self> {
        let header = header.trim();
        if header.is_empty() {
            return Err(ImagegenError::InvalidConfig(
                "auth header name must be non-empty".to_string(),
            ));
        }

        let header = HeaderName::from_bytes(header.as_bytes()).map_err(|err| {
            ImagegenError::InvalidConfig(format!("invalid auth header name {header:?}: {err}"))
        })?;

        let mut value = HeaderValue::from_str(token.trim()).map_err(|err| {
            ImagegenError::InvalidConfig(format!("invalid auth header value for {header:?}: {err}"))
        })?;
        value.set_sensitive(true);

        Ok(Self { header, value })
    }

    pub(crate) fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(self.header.clone(), self.value.clone())
    }
}

/// Looks up the api key for `provider`, preferring configured keys over the defaults.
pub(crate) fn resolve_api_key(
    provider: &str,
    configured_keys: &[String],
    env: &Env,
    default_keys: &[&str],
) -> Result<String> {
    let keys: Vec<&str> = if configured_keys.is_empty() {
        default_keys.to_vec()
    } else {
        configured_keys.iter().map(String::as_str).collect()
    };

    env.first_of(&keys)
        .ok_or_else(|| ImagegenError::MissingCredential {
            provider: provider.to_string(),
            tried: keys.join(", "),
        })
}
