mod auth;
mod env;
mod http;
mod settings;

pub(crate) use auth::{HttpAuth, resolve_api_key};
pub use env::{Env, parse_dotenv};
pub(crate) use http::build_http_client;
pub use settings::ProviderSettings;
