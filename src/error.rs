use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagegenError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid options for {provider}: {reason}")]
    InvalidOptions { provider: String, reason: String },
    #[error("{provider} is not configured: missing api key env (tried: {tried})")]
    MissingCredential { provider: String, tried: String },
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("api error ({status}): {body}")]
    Api {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImagegenError {
    pub fn invalid_options(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    /// Missing or malformed deployment settings, as opposed to bad client input.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingCredential { .. } | Self::InvalidConfig(_))
    }

    pub fn is_client_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::InvalidOptions { .. } | Self::UnsupportedProvider(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ImagegenError>;
