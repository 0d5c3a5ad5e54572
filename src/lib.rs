mod error;
mod profile;

pub mod gateway;
pub mod normalize;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod service;
pub mod tasks;
pub mod types;
pub mod utils;

pub use error::{ImagegenError, Result};
pub use profile::{Env, ProviderSettings, parse_dotenv};
pub use provider::GenerationProvider;
pub use registry::{ProviderFactory, ProviderRegistry};
pub use service::{GenerationInput, GenerationService, ProvidersView};
pub use tasks::{Clock, MemoryTaskStore, SystemClock, TaskStore, TaskStoreConfig};
pub use types::{
    GenerationOutcome, GenerationRequest, ImageInput, OptionMap, ParamKind, ParamList, ParamSpec,
    PollOutcome, ProviderConfig, TaskRecord, TaskResult, TaskStatus,
};

#[cfg(feature = "provider-flux")]
pub use providers::{FluxKontext, FluxKontextModel};
#[cfg(feature = "provider-gemini")]
pub use providers::GeminiImage;
