use base64::Engine as _;
use bytes::Bytes;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Provider-specific request fields, forwarded untouched by the orchestrator.
pub type OptionMap = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    Text,
    File,
    Select,
    Slider,
    Boolean,
}

/// Describes one input a provider accepts, for driving client-side forms.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub kind: ParamKind,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
}

impl ParamSpec {
    fn new(kind: ParamKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            description: None,
            options: Vec::new(),
            min: None,
            max: None,
            step: None,
            default: None,
            required: false,
        }
    }

    pub fn text(label: impl Into<String>) -> Self {
        Self::new(ParamKind::Text, label)
    }

    pub fn file(label: impl Into<String>) -> Self {
        Self::new(ParamKind::File, label)
    }

    pub fn boolean(label: impl Into<String>) -> Self {
        Self::new(ParamKind::Boolean, label)
    }

    pub fn select<I, S>(label: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Self::new(ParamKind::Select, label);
        out.options = options.into_iter().map(Into::into).collect();
        out
    }

    pub fn slider(label: impl Into<String>, min: f64, max: f64, step: f64) -> Self {
        let mut out = Self::new(ParamKind::Slider, label);
        out.min = Some(min);
        out.max = Some(max);
        out.step = Some(step);
        out
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Parameter descriptors in declaration order. Serializes as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamList(Vec<(String, ParamSpec)>);

impl ParamList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        let name = name.into();
        self.0.retain(|(existing, _)| existing != &name);
        self.0.push((name, spec));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.0
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, spec)| spec)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for ParamList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, spec) in &self.0 {
            map.serialize_entry(name, spec)?;
        }
        map.end()
    }
}

/// Static descriptor of a generation backend. One per provider type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderConfig {
    pub name: String,
    pub label: String,
    pub description: String,
    pub is_synchronous: bool,
    pub params: ParamList,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub data: Bytes,
    pub media_type: String,
}

impl std::fmt::Debug for ImageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageInput")
            .field("media_type", &self.media_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl ImageInput {
    pub fn new(data: impl Into<Bytes>, media_type: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            media_type: media_type.into(),
        }
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.to_base64())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub input_image: Option<ImageInput>,
    pub options: OptionMap,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            input_image: None,
            options: OptionMap::new(),
        }
    }

    pub fn with_image(mut self, image: ImageInput) -> Self {
        self.input_image = Some(image);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Result of one generation attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationOutcome {
    Completed {
        image_base64: String,
        format: String,
    },
    Submitted {
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        polling_url: Option<String>,
    },
    Failed {
        message: String,
    },
}

impl GenerationOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    NotFound,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NotFound => "not_found",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub image_url: String,
}

/// Bookkeeping for one asynchronous remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub provider_type: String,
    pub status: TaskStatus,
    /// Seconds since the unix epoch.
    pub created_at: u64,
    #[serde(default)]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub error: Option<String>,
    /// Status endpoint handed out at submission. Polled in place of the provider's default
    /// endpoint when it belongs to the same service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_url: Option<String>,
}

impl TaskRecord {
    pub fn submitted(
        task_id: impl Into<String>,
        provider_type: impl Into<String>,
        polling_url: Option<String>,
        created_at: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            provider_type: provider_type.into(),
            status: TaskStatus::Pending,
            created_at,
            result: None,
            error: None,
            polling_url,
        }
    }

    pub fn not_found(
        task_id: impl Into<String>,
        provider_type: impl Into<String>,
        now: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            provider_type: provider_type.into(),
            status: TaskStatus::NotFound,
            created_at: now,
            result: None,
            error: None,
            polling_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Status(TaskRecord),
    /// The provider finishes work in one call and has no notion of tasks.
    Unsupported { provider: String },
    /// The remote status call itself failed; the task record was left untouched.
    Failed { message: String },
}
