use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::options::{
    option_bool, option_choice, option_int_in_range, option_int_lenient, option_string,
};
use crate::normalize::{failure_message, normalize_status};
use crate::profile::{Env, HttpAuth, ProviderSettings, build_http_client, resolve_api_key};
use crate::provider::GenerationProvider;
use crate::tasks::{Clock, MemoryTaskStore, SystemClock, TaskStore};
use crate::types::{
    GenerationOutcome, GenerationRequest, OptionMap, ParamList, ParamSpec, PollOutcome,
    ProviderConfig, TaskRecord, TaskResult, TaskStatus,
};
use crate::utils::http::{MAX_ERROR_BODY_BYTES, error_detail, response_text_truncated};
use crate::{ImagegenError, Result};

pub const DEFAULT_BASE_URL: &str = "https://api.bfl.ai/v1";

const DEFAULT_KEYS: &[&str] = &["BFL_API_KEY"];
const AUTH_HEADER: &str = "x-key";
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(300);
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

pub const OUTPUT_FORMATS: &[&str] = &["jpeg", "png"];
const DEFAULT_OUTPUT_FORMAT: &str = "jpeg";
const DEFAULT_SAFETY_TOLERANCE: i64 = 2;
const MAX_SAFETY_TOLERANCE: i64 = 6;

/// Aspect ratios offered in the parameter form; any `W:H` is accepted.
const SUGGESTED_ASPECT_RATIOS: &[&str] = &["1:1", "3:4", "4:3", "9:16", "16:9", "21:9", "9:21"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxKontextModel {
    Pro,
    Max,
}

impl FluxKontextModel {
    pub fn provider_type(self) -> &'static str {
        match self {
            Self::Pro => "flux-kontext-pro",
            Self::Max => "flux-kontext-max",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Pro => "FLUX.1 Kontext [pro]",
            Self::Max => "FLUX.1 Kontext [max]",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Pro => "Text-to-image and image editing via Black Forest Labs; results are polled.",
            Self::Max => {
                "Highest-fidelity Kontext model with stronger prompt adherence; results are polled."
            }
        }
    }
}

/// Typed submission options for the Kontext endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxKontextOptions {
    pub output_format: String,
    pub safety_tolerance: i64,
    pub seed: Option<i64>,
    pub aspect_ratio: Option<String>,
    pub prompt_upsampling: bool,
}

impl Default for FluxKontextOptions {
    fn default() -> Self {
        Self {
            output_format: DEFAULT_OUTPUT_FORMAT.to_string(),
            safety_tolerance: DEFAULT_SAFETY_TOLERANCE,
            seed: None,
            aspect_ratio: None,
            prompt_upsampling: false,
        }
    }
}

impl FluxKontextOptions {
    pub fn parse(provider: &str, options: &OptionMap) -> Result<Self> {
        let defaults = Self::default();
        let aspect_ratio = option_string(provider, options, "aspect_ratio")?;
        if let Some(ratio) = aspect_ratio.as_deref().filter(|ratio| !is_ratio(ratio)) {
            return Err(ImagegenError::invalid_options(
                provider,
                format!("aspect_ratio must look like W:H, got {ratio:?}"),
            ));
        }

        Ok(Self {
            output_format: option_choice(provider, options, "output_format", OUTPUT_FORMATS)?
                .unwrap_or(defaults.output_format),
            safety_tolerance: option_int_in_range(
                provider,
                options,
                "safety_tolerance",
                0,
                MAX_SAFETY_TOLERANCE,
            )?
            .unwrap_or(defaults.safety_tolerance),
            seed: option_int_lenient(options, "seed"),
            aspect_ratio,
            prompt_upsampling: option_bool(provider, options, "prompt_upsampling")?
                .unwrap_or(defaults.prompt_upsampling),
        })
    }
}

fn is_ratio(value: &str) -> bool {
    let Some((width, height)) = value.split_once(':') else {
        return false;
    };
    let positive = |part: &str| part.trim().parse::<u32>().is_ok_and(|n| n > 0);
    positive(width) && positive(height)
}

/// Submit-then-poll generation against Black Forest Labs' Kontext models.
#[derive(Clone)]
pub struct FluxKontext {
    http: reqwest::Client,
    base_url: String,
    model: FluxKontextModel,
    auth: Option<HttpAuth>,
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    config: ProviderConfig,
}

impl std::fmt::Debug for FluxKontext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluxKontext")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("auth", &self.auth)
            .finish()
    }
}

impl FluxKontext {
    pub fn new(api_key: impl Into<String>, model: FluxKontextModel) -> Self {
        let http = reqwest::Client::builder()
            .timeout(SUBMIT_TIMEOUT)
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
            model,
            auth,
            tasks: Arc::new(MemoryTaskStore::default()),
            clock: Arc::new(SystemClock),
            config: descriptor(model),
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

    pub fn with_task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn from_settings(
        model: FluxKontextModel,
        settings: &ProviderSettings,
        env: &Env,
    ) -> Result<Self> {
        let api_key = resolve_api_key(
            model.provider_type(),
            &settings.api_key_env,
            env,
            DEFAULT_KEYS,
        )?;
        let auth = HttpAuth::header_value(AUTH_HEADER, &api_key)?;

        let mut out = Self::new("", model);
        out.auth = Some(auth);
        if !settings.http_headers.is_empty() || settings.timeout_secs.is_some() {
            out = out.with_http_client(build_http_client(
                settings.timeout_or(SUBMIT_TIMEOUT),
                &settings.http_headers,
            )?);
        }
        if let Some(base_url) = settings.base_url() {
            out = out.with_base_url(base_url);
        }
        Ok(out)
    }

    pub fn model(&self) -> FluxKontextModel {
        self.model
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.as_ref() {
            Some(auth) => auth.apply(req),
            None => req,
        }
    }

    fn submit_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/{}", self.model.provider_type())
    }

    fn result_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{base}/get_result")
    }

    fn build_body(request: &GenerationRequest, options: &FluxKontextOptions) -> Value {
        let mut body = Map::<String, Value>::new();
        body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        body.insert(
            "output_format".to_string(),
            Value::String(options.output_format.clone()),
        );
        body.insert(
            "safety_tolerance".to_string(),
            Value::from(options.safety_tolerance),
        );
        body.insert(
            "prompt_upsampling".to_string(),
            Value::Bool(options.prompt_upsampling),
        );
        if let Some(aspect_ratio) = options.aspect_ratio.as_deref() {
            body.insert(
                "aspect_ratio".to_string(),
                Value::String(aspect_ratio.to_string()),
            );
        }
        if let Some(seed) = options.seed {
            body.insert("seed".to_string(), Value::from(seed));
        }
        if let Some(image) = request.input_image.as_ref() {
            body.insert("input_image".to_string(), Value::String(image.to_base64()));
        }
        Value::Object(body)
    }

    async fn submit(&self, request: GenerationRequest) -> Result<GenerationOutcome> {
        let options = FluxKontextOptions::parse(self.model.provider_type(), &request.options)?;
        let body = Self::build_body(&request, &options);

        let req = self.http.post(self.submit_url()).json(&body);
        let response = self.apply_auth(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ImagegenError::Api { status, body });
        }

        let parsed = response.json::<SubmitResponse>().await?;
        let task_id = parsed
            .id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ImagegenError::InvalidResponse("submission response is missing `id`".to_string())
            })?;
        let polling_url = parsed.polling_url.filter(|url| !url.trim().is_empty());

        self.tasks.set(TaskRecord::submitted(
            task_id.clone(),
            self.model.provider_type(),
            polling_url.clone(),
            self.clock.now_epoch_seconds(),
        ));

        Ok(GenerationOutcome::Submitted {
            task_id,
            polling_url,
        })
    }

    /// The remote's regional `polling_url`, when it belongs to the same service as `base_url`.
    fn poll_target(&self, record: &TaskRecord) -> Option<url::Url> {
        let mut polling = url::Url::parse(record.polling_url.as_deref()?.trim()).ok()?;
        let base = url::Url::parse(&self.base_url).ok()?;
        if !matches!(polling.scheme(), "http" | "https") {
            return None;
        }
        if !same_service_host(polling.host_str()?, base.host_str()?) {
            return None;
        }
        if !polling.query_pairs().any(|(key, _)| key == "id") {
            polling.query_pairs_mut().append_pair("id", &record.task_id);
        }
        Some(polling)
    }

    async fn fetch_result(&self, record: &TaskRecord) -> Result<ResultResponse> {
        let req = match self.poll_target(record) {
            Some(target) => self.http.get(target),
            None => self
                .http
                .get(self.result_url())
                .query(&[("id", record.task_id.as_str())]),
        }
        .timeout(POLL_TIMEOUT);
        let response = self.apply_auth(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response_text_truncated(response, MAX_ERROR_BODY_BYTES).await;
            return Err(ImagegenError::Api { status, body });
        }
        Ok(response.json::<ResultResponse>().await?)
    }

    fn apply_result(mut record: TaskRecord, remote: ResultResponse) -> TaskRecord {
        let remote_status = remote.status.unwrap_or_default();
        record.status = normalize_status(&remote_status);
        match record.status {
            TaskStatus::Completed => {
                record.result = remote
                    .result
                    .and_then(|result| result.sample)
                    .filter(|url| !url.trim().is_empty())
                    .map(|image_url| TaskResult { image_url });
            }
            TaskStatus::Failed => {
                let remote_error = remote.error.as_ref().map(error_text);
                record.error = Some(failure_message(&remote_status, remote_error.as_deref()));
            }
            _ => {}
        }
        record
    }
}

/// Hosts match exactly, or share their last two labels (`api.eu1.bfl.ai` and `api.bfl.ai`).
/// IP literals must match exactly.
fn same_service_host(candidate: &str, base: &str) -> bool {
    let candidate = candidate.trim_end_matches('.').to_ascii_lowercase();
    let base = base.trim_end_matches('.').to_ascii_lowercase();
    if candidate == base {
        return true;
    }
    let is_ip = |host: &str| host.trim_matches(['[', ']']).parse::<std::net::IpAddr>().is_ok();
    if is_ip(&candidate) || is_ip(&base) {
        return false;
    }
    let site = |host: &str| -> Option<String> {
        let labels: Vec<&str> = host.rsplitn(3, '.').take(2).collect();
        (labels.len() == 2 && labels.iter().all(|label| !label.is_empty()))
            .then(|| format!("{}.{}", labels[1], labels[0]))
    };
    site(&candidate).is_some_and(|site_a| site(&base).is_some_and(|site_b| site_a == site_b))
}

pub fn descriptor(model: FluxKontextModel) -> ProviderConfig {
    ProviderConfig {
        name: model.provider_type().to_string(),
        label: model.label().to_string(),
        description: model.description().to_string(),
        is_synchronous: false,
        params: ParamList::new()
            .with(
                "prompt",
                ParamSpec::text("Prompt")
                    .with_description("Scene description, or an edit instruction when an image is given.")
                    .required(),
            )
            .with(
                "input_image",
                ParamSpec::file("Input image")
                    .with_description("Optional image to edit; omit for text-to-image."),
            )
            .with(
                "aspect_ratio",
                ParamSpec::select("Aspect ratio", SUGGESTED_ASPECT_RATIOS.iter().copied()),
            )
            .with(
                "output_format",
                ParamSpec::select("Output format", OUTPUT_FORMATS.iter().copied())
                    .with_default(DEFAULT_OUTPUT_FORMAT),
            )
            .with(
                "safety_tolerance",
                ParamSpec::slider("Safety tolerance", 0.0, MAX_SAFETY_TOLERANCE as f64, 1.0)
                    .with_default(DEFAULT_SAFETY_TOLERANCE)
                    .with_description("0 is the strictest moderation, 6 the most permissive."),
            )
            .with(
                "seed",
                ParamSpec::text("Seed").with_description("Integer seed for reproducible output."),
            )
            .with(
                "prompt_upsampling",
                ParamSpec::boolean("Prompt upsampling").with_default(false),
            ),
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    polling_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<RemoteResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RemoteResult {
    #[serde(default)]
    sample: Option<String>,
}

fn error_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn submit_failure(err: ImagegenError) -> GenerationOutcome {
    match err {
        ImagegenError::Api { status, body } => {
            let detail = error_detail(&body, &["/detail", "/error/message"])
                .unwrap_or_else(|| "image generation request failed".to_string());
            GenerationOutcome::failed(format!("remote call failed ({status}): {detail}"))
        }
        other => GenerationOutcome::failed(format!("image generation failed: {other}")),
    }
}

fn poll_failure(err: ImagegenError) -> PollOutcome {
    let message = match err {
        ImagegenError::Api { status, body } => match error_detail(&body, &["/detail"]) {
            Some(detail) => format!("task status query failed ({status}): {detail}"),
            None => format!("task status query failed ({status})"),
        },
        other => format!("task status query failed: {other}"),
    };
    PollOutcome::Failed { message }
}

#[async_trait]
impl GenerationProvider for FluxKontext {
    fn provider_type(&self) -> &str {
        self.model.provider_type()
    }

    fn describe(&self) -> &ProviderConfig {
        &self.config
    }

    fn validate(&self, options: &OptionMap) -> Result<()> {
        FluxKontextOptions::parse(self.model.provider_type(), options).map(|_| ())
    }

    async fn generate(&self, request: GenerationRequest) -> GenerationOutcome {
        let provider = self.model.provider_type();
        let has_image = request.input_image.is_some();
        match self.submit(request).await {
            Ok(outcome) => {
                if let GenerationOutcome::Submitted { task_id, .. } = &outcome {
                    tracing::info!(provider, task_id = %task_id, has_image, "task submitted");
                }
                outcome
            }
            Err(err) => {
                tracing::warn!(provider, error = %err, "task submission failed");
                submit_failure(err)
            }
        }
    }

    async fn poll_status(&self, task_id: &str) -> PollOutcome {
        let provider = self.model.provider_type();
        let Some(record) = self
            .tasks
            .get(task_id)
            .filter(|record| record.provider_type == provider)
        else {
            return PollOutcome::Status(TaskRecord::not_found(
                task_id,
                provider,
                self.clock.now_epoch_seconds(),
            ));
        };
        if record.status.is_terminal() {
            return PollOutcome::Status(record);
        }

        match self.fetch_result(&record).await {
            Ok(remote) => {
                let updated = Self::apply_result(record, remote);
                if updated.status.is_terminal() {
                    tracing::info!(provider, task_id, status = %updated.status, "task finished");
                }
                self.tasks.set(updated.clone());
                PollOutcome::Status(updated)
            }
            Err(err) => {
                tracing::warn!(provider, task_id, error = %err, "task status query failed");
                poll_failure(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskStoreConfig;
    use crate::tasks::tests::ManualClock;
    use crate::types::ImageInput;
    use httpmock::{
        Method::{GET, POST},
        MockServer,
    };
    use serde_json::json;

    fn options(value: Value) -> OptionMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn clocked_store() -> (Arc<MemoryTaskStore>, Arc<ManualClock>) {
        let clock = ManualClock::at(0);
        let store = Arc::new(MemoryTaskStore::with_clock(
            TaskStoreConfig::default(),
            clock.clone(),
        ));
        (store, clock)
    }

    fn provider(server: &MockServer) -> (FluxKontext, Arc<MemoryTaskStore>) {
        let (store, clock) = clocked_store();
        let provider = FluxKontext::new("bfl-test", FluxKontextModel::Pro)
            .with_base_url(server.url("/v1"))
            .with_task_store(store.clone())
            .with_clock(clock);
        (provider, store)
    }

    #[test]
    fn defaults_match_remote_expectations() -> Result<()> {
        let parsed = FluxKontextOptions::parse("flux-kontext-pro", &OptionMap::new())?;
        assert_eq!(parsed, FluxKontextOptions::default());
        assert_eq!(parsed.output_format, "jpeg");
        assert_eq!(parsed.safety_tolerance, 2);
        assert!(!parsed.prompt_upsampling);
        assert_eq!(parsed.aspect_ratio, None);
        Ok(())
    }

    #[test]
    fn invalid_seed_is_ignored() -> Result<()> {
        let parsed = FluxKontextOptions::parse(
            "flux-kontext-pro",
            &options(json!({ "seed": "not-a-number", "prompt_upsampling": "true" })),
        )?;
        assert_eq!(parsed.seed, None);
        assert!(parsed.prompt_upsampling);

        let parsed =
            FluxKontextOptions::parse("flux-kontext-pro", &options(json!({ "seed": "42" })))?;
        assert_eq!(parsed.seed, Some(42));
        Ok(())
    }

    #[test]
    fn out_of_range_options_are_rejected() {
        let provider = FluxKontext::new("k", FluxKontextModel::Max);
        for bad in [
            json!({ "safety_tolerance": 7 }),
            json!({ "output_format": "webp" }),
            json!({ "aspect_ratio": "wide" }),
            json!({ "prompt_upsampling": "sometimes" }),
        ] {
            let err = provider
                .validate(&options(bad.clone()))
                .expect_err("should be rejected");
            assert!(err.is_client_input(), "{bad}: {err}");
        }
        assert!(provider.validate(&options(json!({ "aspect_ratio": "21:9" }))).is_ok());
    }

    #[test]
    fn body_carries_image_and_optional_fields() -> Result<()> {
        let request = GenerationRequest::new("make it snow")
            .with_image(ImageInput::new(vec![1u8, 2, 3], "image/png"))
            .with_option("seed", 7);
        let parsed = FluxKontextOptions::parse("flux-kontext-pro", &request.options)?;
        let body = FluxKontext::build_body(&request, &parsed);
        assert_eq!(
            body,
            json!({
                "prompt": "make it snow",
                "output_format": "jpeg",
                "safety_tolerance": 2,
                "prompt_upsampling": false,
                "seed": 7,
                "input_image": "AQID"
            })
        );
        Ok(())
    }

    #[test]
    fn descriptors_differ_per_model() {
        let pro = descriptor(FluxKontextModel::Pro);
        let max = descriptor(FluxKontextModel::Max);
        assert_eq!(pro.name, "flux-kontext-pro");
        assert_eq!(max.name, "flux-kontext-max");
        assert!(!pro.is_synchronous);
        assert_eq!(pro.params.names().next(), Some("prompt"));
    }

    #[test]
    fn from_settings_requires_bfl_key() {
        let settings = ProviderSettings {
            api_key_env: vec!["IMAGEGEN_TEST_UNSET_BFL_KEY".to_string()],
            ..ProviderSettings::default()
        };
        let err = FluxKontext::from_settings(FluxKontextModel::Pro, &settings, &Env::default())
            .expect_err("no key configured");
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn submission_records_pending_task() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/flux-kontext-pro")
                    .header("x-key", "bfl-test")
                    .json_body_includes(r#"{"prompt":"a red fox"}"#)
                    .json_body_includes(r#"{"output_format":"jpeg"}"#)
                    .json_body_includes(r#"{"safety_tolerance":2}"#)
                    .body_excludes("input_image");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "id": "abc123", "polling_url": "https://x/abc123" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        let outcome = provider.generate(GenerationRequest::new("a red fox")).await;

        mock.assert_async().await;
        assert_eq!(
            outcome,
            GenerationOutcome::Submitted {
                task_id: "abc123".to_string(),
                polling_url: Some("https://x/abc123".to_string()),
            }
        );
        let record = store.get("abc123").expect("task recorded");
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.provider_type, "flux-kontext-pro");
        Ok(())
    }

    #[tokio::test]
    async fn submission_failure_carries_remote_detail() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/flux-kontext-pro");
                then.status(402)
                    .header("content-type", "application/json")
                    .body(json!({ "detail": "Insufficient credits" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        let outcome = provider.generate(GenerationRequest::new("a red fox")).await;

        mock.assert_async().await;
        match outcome {
            GenerationOutcome::Failed { message } => {
                assert!(message.contains("Insufficient credits"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn submission_without_detail_uses_fallback() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/flux-kontext-pro");
                then.status(500).body("upstream exploded");
            })
            .await;

        let (provider, _) = provider(&server);
        match provider.generate(GenerationRequest::new("a red fox")).await {
            GenerationOutcome::Failed { message } => {
                assert!(message.contains("image generation request failed"), "{message}");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn ready_task_is_cached_after_first_poll() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/get_result")
                    .query_param("id", "abc123")
                    .header("x-key", "bfl-test");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(
                        json!({
                            "id": "abc123",
                            "status": "Ready",
                            "result": { "sample": "https://img/1.png" }
                        })
                        .to_string(),
                    );
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted("abc123", "flux-kontext-pro", None, 0));

        let first = provider.poll_status("abc123").await;
        let second = provider.poll_status("abc123").await;

        mock.assert_calls(1);
        let PollOutcome::Status(record) = first else {
            panic!("unexpected poll outcome: {first:?}");
        };
        assert_eq!(record.status, TaskStatus::Completed);
        assert_eq!(
            record.result,
            Some(TaskResult {
                image_url: "https://img/1.png".to_string()
            })
        );
        assert_eq!(second, PollOutcome::Status(record));
        Ok(())
    }

    #[tokio::test]
    async fn expired_remote_task_fails_with_readable_message() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/get_result");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "id": "abc123", "status": "Task not found" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted("abc123", "flux-kontext-pro", None, 0));

        match provider.poll_status("abc123").await {
            PollOutcome::Status(record) => {
                assert_eq!(record.status, TaskStatus::Failed);
                assert_eq!(
                    record.error.as_deref(),
                    Some("task expired or missing on the remote backend")
                );
            }
            other => panic!("unexpected poll outcome: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn running_task_is_polled_again() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/get_result");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "id": "abc123", "status": "Processing" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted("abc123", "flux-kontext-pro", None, 0));

        for _ in 0..2 {
            match provider.poll_status("abc123").await {
                PollOutcome::Status(record) => assert_eq!(record.status, TaskStatus::Running),
                other => panic!("unexpected poll outcome: {other:?}"),
            }
        }
        mock.assert_calls(2);
        Ok(())
    }

    #[tokio::test]
    async fn status_query_failure_leaves_record_untouched() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/get_result");
                then.status(503)
                    .header("content-type", "application/json")
                    .body(json!({ "detail": "try later" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted("abc123", "flux-kontext-pro", None, 0));

        match provider.poll_status("abc123").await {
            PollOutcome::Failed { message } => assert!(message.contains("try later"), "{message}"),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
        assert_eq!(
            store.get("abc123").map(|record| record.status),
            Some(TaskStatus::Pending)
        );
        Ok(())
    }

    #[tokio::test]
    async fn unknown_task_is_not_found_without_remote_call() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/get_result");
                then.status(200).body("{}");
            })
            .await;

        let clock = ManualClock::at(1_700_000_000);
        let store = Arc::new(MemoryTaskStore::with_clock(
            TaskStoreConfig::default(),
            clock.clone(),
        ));
        let provider = FluxKontext::new("bfl-test", FluxKontextModel::Pro)
            .with_base_url(server.url("/v1"))
            .with_task_store(store)
            .with_clock(clock);

        match provider.poll_status("never-submitted").await {
            PollOutcome::Status(record) => {
                assert_eq!(record.status, TaskStatus::NotFound);
                assert_eq!(record.created_at, 1_700_000_000);
            }
            other => panic!("unexpected poll outcome: {other:?}"),
        }
        mock.assert_calls(0);
        Ok(())
    }

    #[test]
    fn regional_hosts_count_as_the_same_service() {
        assert!(same_service_host("api.eu1.bfl.ai", "api.bfl.ai"));
        assert!(same_service_host("API.BFL.AI.", "api.bfl.ai"));
        assert!(same_service_host("127.0.0.1", "127.0.0.1"));
        assert!(!same_service_host("bfl.ai.evil.example", "api.bfl.ai"));
        assert!(!same_service_host("10.0.0.1", "127.0.0.1"));
        assert!(!same_service_host("localhost", "api.bfl.ai"));
    }

    #[tokio::test]
    async fn regional_polling_url_is_used_for_status() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let regional = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/regional/get_result")
                    .query_param("id", "abc123")
                    .header("x-key", "bfl-test");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "id": "abc123", "status": "Pending" }).to_string());
            })
            .await;
        let global = server
            .mock_async(|when, then| {
                when.method(GET).path("/v1/get_result");
                then.status(200).body("{}");
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted(
            "abc123",
            "flux-kontext-pro",
            Some(server.url("/v1/regional/get_result")),
            0,
        ));

        match provider.poll_status("abc123").await {
            PollOutcome::Status(record) => assert_eq!(record.status, TaskStatus::Pending),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
        regional.assert_calls(1);
        global.assert_calls(0);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_polling_url_falls_back_to_base_endpoint() -> Result<()> {
        if crate::utils::test_support::should_skip_httpmock() {
            return Ok(());
        }
        let server = MockServer::start_async().await;
        let global = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/v1/get_result")
                    .query_param("id", "abc123");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(json!({ "id": "abc123", "status": "Pending" }).to_string());
            })
            .await;

        let (provider, store) = provider(&server);
        store.set(TaskRecord::submitted(
            "abc123",
            "flux-kontext-pro",
            Some("https://collector.example/get_result?id=abc123".to_string()),
            0,
        ));

        assert!(matches!(
            provider.poll_status("abc123").await,
            PollOutcome::Status(_)
        ));
        global.assert_calls(1);
        Ok(())
    }

    #[tokio::test]
    async fn tasks_of_another_model_are_not_visible() {
        let (store, _clock) = clocked_store();
        store.set(TaskRecord::submitted("abc123", "flux-kontext-pro", None, 0));
        let max = FluxKontext::new("k", FluxKontextModel::Max).with_task_store(store);
        match max.poll_status("abc123").await {
            PollOutcome::Status(record) => assert_eq!(record.status, TaskStatus::NotFound),
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }
}
