//! Lazily constructed, memoized provider instances keyed by provider type.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::gateway::GatewayConfig;
use crate::profile::Env;
use crate::provider::GenerationProvider;
use crate::types::ProviderConfig;
use crate::{ImagegenError, Result};

/// Builds one provider instance. May fail, e.g. when a credential is absent.
pub type ProviderFactory =
    Arc<dyn Fn() -> Result<Arc<dyn GenerationProvider>> + Send + Sync + 'static>;

struct Slot {
    provider_type: String,
    factory: ProviderFactory,
    instance: OnceCell<Arc<dyn GenerationProvider>>,
}

/// Holds one factory per provider type and at most one constructed instance of each.
///
/// Construction runs on first [`resolve`](Self::resolve) for a type. Concurrent first calls
/// wait on the same initialisation; a failed construction is not memoized, so a later call
/// retries it.
#[derive(Default)]
pub struct ProviderRegistry {
    slots: Vec<Slot>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let types: Vec<(&str, bool)> = self
            .slots
            .iter()
            .map(|slot| (slot.provider_type.as_str(), slot.instance.initialized()))
            .collect();
        f.debug_struct("ProviderRegistry")
            .field("providers", &types)
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `provider_type`, replacing any earlier registration in place.
    pub fn register<F>(&mut self, provider_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Result<Arc<dyn GenerationProvider>> + Send + Sync + 'static,
    {
        let provider_type = provider_type.into();
        let slot = Slot {
            provider_type: provider_type.clone(),
            factory: Arc::new(factory),
            instance: OnceCell::new(),
        };
        match self
            .slots
            .iter_mut()
            .find(|existing| existing.provider_type == provider_type)
        {
            Some(existing) => *existing = slot,
            None => self.slots.push(slot),
        }
        self
    }

    pub fn with<F>(mut self, provider_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn GenerationProvider>> + Send + Sync + 'static,
    {
        self.register(provider_type, factory);
        self
    }

    pub fn provider_types(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|slot| slot.provider_type.as_str())
    }

    pub fn contains(&self, provider_type: &str) -> bool {
        self.slot(provider_type).is_some()
    }

    fn slot(&self, provider_type: &str) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.provider_type == provider_type)
    }

    pub async fn resolve(&self, provider_type: &str) -> Result<Arc<dyn GenerationProvider>> {
        let slot = self
            .slot(provider_type)
            .ok_or_else(|| ImagegenError::UnsupportedProvider(provider_type.to_string()))?;
        let instance = slot
            .instance
            .get_or_try_init(|| async {
                let provider = (slot.factory)()?;
                tracing::info!(provider_type = %slot.provider_type, "provider constructed");
                Ok::<_, ImagegenError>(provider)
            })
            .await?;
        Ok(Arc::clone(instance))
    }

    /// Alias of [`resolve`](Self::resolve).
    pub async fn get(&self, provider_type: &str) -> Result<Arc<dyn GenerationProvider>> {
        self.resolve(provider_type).await
    }

    /// Descriptors of every provider that can be constructed, in registration order.
    pub async fn list_all(&self) -> Vec<ProviderConfig> {
        let mut out = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            match self.resolve(&slot.provider_type).await {
                Ok(provider) => out.push(provider.describe().clone()),
                Err(err) => {
                    tracing::warn!(
                        provider_type = %slot.provider_type,
                        error = %err,
                        "skipping provider that cannot be constructed"
                    );
                }
            }
        }
        out
    }

    /// Registers every backend compiled into this build.
    pub fn builtin(config: &GatewayConfig, env: &Env) -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();

        #[cfg(feature = "provider-flux")]
        {
            use crate::providers::{FluxKontext, FluxKontextModel};
            use crate::tasks::{MemoryTaskStore, TaskStore};

            let tasks: Arc<dyn TaskStore> =
                Arc::new(MemoryTaskStore::new(config.task_store.clone()));
            for model in [FluxKontextModel::Pro, FluxKontextModel::Max] {
                let settings = config.provider_settings(model.provider_type());
                let env = env.clone();
                let tasks = Arc::clone(&tasks);
                registry.register(model.provider_type(), move || {
                    let provider = FluxKontext::from_settings(model, &settings, &env)?
                        .with_task_store(Arc::clone(&tasks));
                    Ok(Arc::new(provider) as Arc<dyn GenerationProvider>)
                });
            }
        }

        #[cfg(feature = "provider-gemini")]
        {
            use crate::providers::GeminiImage;
            use crate::providers::gemini_image::PROVIDER_TYPE;

            let settings = config.provider_settings(PROVIDER_TYPE);
            let env = env.clone();
            registry.register(PROVIDER_TYPE, move || {
                let provider = GeminiImage::from_settings(&settings, &env)?;
                Ok(Arc::new(provider) as Arc<dyn GenerationProvider>)
            });
        }

        #[cfg(not(any(feature = "provider-flux", feature = "provider-gemini")))]
        let _ = (config, env);

        registry
    }
}
