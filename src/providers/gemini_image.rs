use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::options::option_choice;
use crate::profile::{Env, HttpAuth, ProviderSettings, build_http_client, resolve_api_key};
use crate::provider::GenerationProvider;
use crate::types::{
    GenerationOutcome, GenerationRequest, ImageInput, OptionMap, ParamList, ParamSpec,
    ProviderConfig,
};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, error_detail, response_text_truncated};
use crate::{ImagegenError, Result};

pub const PROVIDER_TYPE: &str = "gemini-image";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_KEYS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];
const MODEL_ENV: &str = "GEMINI_IMAGE_MODEL";
const AUTH_HEADER: &str = "x-goog-api-key";
const GENERATE_TIMEOUT: Duration = Duration::from_secs(300);

pub const ASPECT_RATIOS: &[&str] = &[
    "1:1", "2:3", "3:2", "3:4", "4:3", "4:5", "5:4", "9:16", "16:9", "21:9",
];
pub const IMAGE_SIZES: &[&str] = &["1K", "2K", "4K"];

const HARM_CATEGORIES: &[&str] = &[
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// Generation controls accepted by the multimodal backend. Unset fields are left to the remote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeminiImageOptions {
    pub aspect_ratio: Option<String>,
    pub image_size: Option<String>,
}

impl GeminiImageOptions {
    pub fn parse(options: &OptionMap) -> Result<Self> {
        Ok(Self {
            aspect_ratio: option_choice(PROVIDER_TYPE, options, "aspect_ratio", ASPECT_RATIOS)?,
            image_size: option_choice(PROVIDER_TYPE, options, "image_size", IMAGE_SIZES)?,
        })
    }

    fn image_config(&self) -> Option<Value> {
        let mut config = Map::<String, Value>::new();
        if let Some(aspect_ratio) = self.aspect_ratio.as_deref() {
            config.insert("aspectRatio".to_string(), Value::String(aspect_ratio.to_string()));
        }
        if let Some(image_size) = self.image_size.as_deref() {
            config.insert("imageSize".to_string(), Value::String(image_size.to_string()));
        }
        (!config.is_empty()).then_some(Value::Object(config))
    }
}

/// Single round-trip image generation against the Google Generative Language API.
#[derive(Clone)]
pub struct GeminiImage {
    http: reqwest::Client,
    base_url: String,
    model: String,
    auth: Option<HttpAuth>,
    disable_safety_filters: bool,
    config: ProviderConfig,
}

impl std::fmt::Debug for GeminiImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiImage")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("auth", &self.auth)
            .field("disable_safety_filters", &self.disable_safety_filters)
            .finish()
    }
}

impl GeminiImage {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(GENERATE_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let api_key = api_key.into();
        let auth = if api_key.trim().is_empty() {
            None
        } else {
            HttpAuth::header_value(AUTH_HEADER, &api_key).ok()
        };

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            auth,
            disable_safety_filters: true,
            config: descriptor(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// When set, every harm category is sent with `BLOCK_NONE`.
    pub fn with_safety_filters_disabled(mut self, disabled: bool) -> Self {
        self.disable_safety_filters = disabled;
        self
    }

    pub fn from_settings(settings: &ProviderSettings, env: &Env) -> Result<Self> {
        let api_key = resolve_api_key(PROVIDER_TYPE, &settings.api_key_env, env, DEFAULT_KEYS)?;
        let auth = HttpAuth::header_value(AUTH_HEADER, &api_key)?;

        let mut out = Self::new("");
        out.auth = Some(auth);
        if !settings.http_headers.is_empty() || settings.timeout_secs.is_some() {
            out = out.with_http_client(build_http_client(
                settings.timeout_or(GENERATE_TIMEOUT),
                &settings.http_headers,
            )?);
        }
        if let Some(base_url) = settings.base_url() {
            out = out.with_base_url(base_url);
        }
        if let Some(model) = settings.model() {
            out = out.with_model(model);
        } else if let Some(model) = env.get(MODEL_ENV) {
            out = out.with_model(model.trim());
        }
        if let Some(disabled) = settings.disable_safety_filters {
            out = out.with_safety_filters_disabled(disabled);
        }
        if out.disable_safety_filters {
            tracing::warn!(
                provider = PROVIDER_TYPE,
                model = %out.model,
                "remote safety filters are disabled for every harm category"
            );
        }
        Ok(out)
    }

    fn generate_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let model = self.model.trim().trim_start_matches("models/");
        format!("{base}/models/{model}:generateContent")
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.as_ref() {
            Some(auth) => auth.apply(req),
            None => req,
        }
    }

    fn build_body(
        &self,
        prompt: &str,
        image: Option<&ImageInput>,
        options: &GeminiImageOptions,
    ) -> Value {
        let mut parts = vec![json!({ "text": prompt })];
        if let Some(image) = image {
            parts.push(json!({
                "inlineData": {
                    "mimeType": image.media_type,
                    "data": image.to_base64(),
                }
            }));
        }

        let mut generation_config = Map::<String, Value>::new();
        generation_config.insert("responseModalities".to_string(), json!(["TEXT", "IMAGE"]));
        if let Some(image_config) = options.image_config() {
            generation_config.insert("imageConfig".to_string(), image_config);
        }

        let mut body = Map::<String, Value>::new();
        body.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        body.insert("tools".to_string(), json!([{ "googleSearch": {} }]));
        body.insert(
            "generationConfig".to_string(),
            Value::Object(generation_config),
        );
        if self.disable_safety_filters {
            let settings: Vec<Value> = HARM_CATEGORIES
                .iter()
                .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
                .collect();
            body.insert("safetySettings".to_string(), Value::Array(settings));
        }
        Value::Object(body)
    }

    async fn call(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let options = GeminiImageOptions::parse(&request.options)?;
        let body = self.build_body(&request.prompt, request.input_image.as_ref(), &options);

        let req = self.http.post(self.generate_url()).json(&body);
        let response = self.apply_auth(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ImagegenError::Api { status, body });
        }

        let parsed = response.json::<GenerateContentResponse>().await?;
        Ok(parse_generate_response(parsed))
    }
}

pub fn descriptor() -> ProviderConfig {
    ProviderConfig {
        name: PROVIDER_TYPE.to_string(),
        label: "Gemini Image".to_string(),
        description: "Multimodal text-and-image generation in a single call, with search grounding."
            .to_string(),
        is_synchronous: true,
        params: ParamList::new()
            .with(
                "prompt",
                ParamSpec::text("Prompt")
                    .with_description("What to draw, or how to edit the input image.")
                    .required(),
            )
            .with(
                "input_image",
                ParamSpec::file("Input image")
                    .with_description("Optional reference image for editing."),
            )
            .with(
                "aspect_ratio",
                ParamSpec::select("Aspect ratio", ASPECT_RATIOS.iter().copied()),
            )
            .with(
                "image_size",
                ParamSpec::select("Resolution", IMAGE_SIZES.iter().copied()),
            ),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, alias = "inline_data")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default, alias = "mime_type")]
    mime_type: Option<String>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

fn format_from_mime(mime_type: Option<&str>) -> String {
    mime_type
        .and_then(|mime| mime.trim().strip_prefix("image/"))
        .filter(|format| !format.is_empty())
        .unwrap_or("png")
        .to_string()
}

/// Inline image data as standard-alphabet base64. Url-safe or unpadded payloads and embedded
/// whitespace are accepted; `None` when the payload does not decode at all.
fn normalize_base64(data: &str) -> Option<String> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};

    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if STANDARD.decode(compact.as_bytes()).is_ok() {
        return Some(compact);
    }
    [URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(compact.as_bytes()).ok())
        .map(|bytes| STANDARD.encode(bytes))
}

fn parse_generate_response(response: GenerateContentResponse) -> GenerationOutcome {
    let mut finish_reason = None::<String>;
    for candidate in response.candidates {
        if finish_reason.is_none() {
            finish_reason = candidate.finish_reason.clone();
        }
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(text) = part.text.as_deref().filter(|t| !t.trim().is_empty()) {
                tracing::debug!(provider = PROVIDER_TYPE, text = %text, "text part in response");
            }
            let Some(inline) = part.inline_data else {
                continue;
            };
            let Some(data) = inline.data.as_deref().filter(|data| !data.trim().is_empty()) else {
                continue;
            };
            let Some(image_base64) = normalize_base64(data) else {
                return GenerationOutcome::failed(
                    "remote returned image data that is not valid base64",
                );
            };
            return GenerationOutcome::Completed {
                image_base64,
                format: format_from_mime(inline.mime_type.as_deref()),
            };
        }
    }

    let reason = response
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
        .map(|reason| format!("blocked: {reason}"))
        .or_else(|| finish_reason.map(|reason| format!("finish reason: {reason}")));
    match reason {
        Some(reason) => GenerationOutcome::failed(format!("no image was produced ({reason})")),
        None => GenerationOutcome::failed("no image was produced"),
    }
}

fn failure_from_error(err: ImagegenError) -> GenerationOutcome {
    match err {
        ImagegenError::Api { status, body } => {
            let detail = error_detail(&body, &["/error/message", "/detail"])
                .unwrap_or_else(|| "image generation request failed".to_string());
            GenerationOutcome::failed(format!("remote call failed ({status}): {detail}"))
        }
        other => GenerationOutcome::failed(format!("image generation failed: {other}")),
    }
}

#[async_trait]
impl GenerationProvider for GeminiImage {
    fn provider_type(&self) -> &str {
        PROVIDER_TYPE
    }

    fn describe(&self) -> &ProviderConfig {
        &self.config
    }

    fn validate(&self, options: &OptionMap) -> Result<()> {
        GeminiImageOptions::parse(options).map(|_| ())
    }

    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome {
        let has_image = request.input_image.is_some();
        match self.call(request).await {
            Ok(outcome) => {
                tracing::info!(
                    provider = PROVIDER_TYPE,
                    model = %self.model,
                    has_image,
                    completed = !outcome.is_failed(),
                    "generation finished"
                );
                outcome
            }
            Err(err) => {
                tracing::warn!(provider = PROVIDER_TYPE, model = %self.model, error = %err, "generation failed");
                failure_from_error(err)
            }
        }
    }
}
