#[cfg(feature = "provider-flux")]
pub mod flux_kontext;
#[cfg(feature = "provider-gemini")]
pub mod gemini_image;

mod options;

#[cfg(feature = "provider-flux")]
pub use flux_kontext::{FluxKontext, FluxKontextModel, FluxKontextOptions};
#[cfg(feature = "provider-gemini")]
pub use gemini_image::{GeminiImage, GeminiImageOptions};
