use async_trait::async_trait;

use crate::Result;
use crate::types::{GenerationOutcome, GenerationRequest, OptionMap, PollOutcome, ProviderConfig};

/// A backend bound to one remote image-generation service.
///
/// `generate` and `poll_status` never return errors: transport and remote failures are
/// folded into `GenerationOutcome::Failed` / `PollOutcome::Failed` so callers only branch
/// on values.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    fn provider_type(&self) -> &str;

    /// Stable descriptor used to render parameter forms.
    fn describe(&self) -> &ProviderConfig;

    /// Checks provider-specific options without touching the network.
    fn validate(&self, options: &OptionMap) -> Result<()>;

    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome;

    async fn poll_status(&self, _task_id: &str) -> PollOutcome {
        PollOutcome::Unsupported {
            provider: self.provider_type().to_string(),
        }
    }
}
