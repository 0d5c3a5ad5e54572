use std::sync::Arc;

use serde::Serialize;

use crate::registry::ProviderRegistry;
use crate::types::{
    GenerationOutcome, GenerationRequest, ImageInput, OptionMap, PollOutcome, ProviderConfig,
};
use crate::{ImagegenError, Result};

/// A decoded generation call, before a provider has been chosen.
#[derive(Debug, Clone, Default)]
pub struct GenerationInput {
    pub prompt: String,
    pub provider_type: Option<String>,
    pub input_image: Option<ImageInput>,
    pub options: OptionMap,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvidersView {
    pub default_provider: String,
    pub providers: Vec<ProviderConfig>,
}

/// Provider-agnostic entry point used by the HTTP layer.
#[derive(Debug, Clone)]
pub struct GenerationService {
    registry: Arc<ProviderRegistry>,
    default_provider: String,
}

impl GenerationService {
    pub fn new(registry: Arc<ProviderRegistry>, default_provider: impl Into<String>) -> Self {
        Self {
            registry,
            default_provider: default_provider.into(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn default_provider(&self) -> &str {
        &self.default_provider
    }

    fn provider_type<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(&self.default_provider)
    }

    pub async fn generate(&self, input: GenerationInput) -> Result<GenerationOutcome> {
        if input.prompt.trim().is_empty() {
            return Err(ImagegenError::InvalidRequest(
                "prompt is required".to_string(),
            ));
        }

        let provider_type = self.provider_type(input.provider_type.as_deref());
        let provider = self.registry.resolve(provider_type).await?;
        provider.validate(&input.options)?;

        tracing::debug!(
            provider_type,
            has_image = input.input_image.is_some(),
            options = input.options.len(),
            "dispatching generation"
        );
        let request = GenerationRequest {
            prompt: input.prompt,
            input_image: input.input_image,
            options: input.options,
        };
        Ok(provider.generate(request).await)
    }

    pub async fn status(&self, provider_type: Option<&str>, task_id: &str) -> Result<PollOutcome> {
        let task_id = task_id.trim();
        if task_id.is_empty() {
            return Err(ImagegenError::InvalidRequest(
                "task id is required".to_string(),
            ));
        }

        let provider = self.registry.resolve(self.provider_type(provider_type)).await?;
        Ok(provider.poll_status(task_id).await)
    }

    pub async fn providers(&self) -> ProvidersView {
        ProvidersView {
            default_provider: self.default_provider.clone(),
            providers: self.registry.list_all().await,
        }
    }
}
