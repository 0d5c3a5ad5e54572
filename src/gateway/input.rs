//! Turns inbound request bodies into [`GenerationInput`] values.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use super::multipart::{FormPart, is_multipart, parse_form};
use crate::service::GenerationInput;
use crate::types::{ImageInput, OptionMap};
use crate::{ImagegenError, Result};

const PROMPT_FIELD: &str = "prompt";
const PROVIDER_FIELD: &str = "provider_type";
const IMAGE_FIELD: &str = "input_image";
const UPLOAD_FIELD: &str = "file";

/// (extension, media type) pairs accepted for input images.
const ALLOWED_IMAGES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("webp", "image/webp"),
];

const UNSUPPORTED_FORMAT: &str =
    "unsupported image format; use PNG, JPG, JPEG, GIF, BMP or WEBP";

fn unsupported_format() -> ImagegenError {
    ImagegenError::InvalidRequest(UNSUPPORTED_FORMAT.to_string())
}

/// Maps a declared media type onto the allow-list. `image/jpg` is accepted as jpeg.
fn allowed_media_type(raw: &str) -> Option<&'static str> {
    let essence = raw.split(';').next().unwrap_or(raw).trim().to_ascii_lowercase();
    let essence = if essence == "image/jpg" {
        "image/jpeg".to_string()
    } else {
        essence
    };
    ALLOWED_IMAGES
        .iter()
        .map(|(_, media_type)| *media_type)
        .find(|media_type| *media_type == essence)
}

fn media_type_for_filename(filename: &str) -> Option<&'static str> {
    let (_, extension) = filename.rsplit_once('.')?;
    let extension = extension.trim().to_ascii_lowercase();
    ALLOWED_IMAGES
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, media_type)| *media_type)
}

fn sniff_media_type(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.starts_with(b"BM") {
        Some("image/bmp")
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// Decodes standard or URL-safe base64, padded or not, ignoring embedded whitespace.
fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    [STANDARD, URL_SAFE, STANDARD_NO_PAD, URL_SAFE_NO_PAD]
        .iter()
        .find_map(|engine| engine.decode(compact.as_bytes()).ok())
        .ok_or_else(|| ImagegenError::InvalidRequest("input_image is not valid base64".to_string()))
}

/// Accepts `data:<media type>;base64,<payload>` or bare base64.
pub fn decode_image_string(raw: &str) -> Result<ImageInput> {
    let raw = raw.trim();
    let (declared, payload) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (meta, payload) = rest.split_once(',').ok_or_else(|| {
                ImagegenError::InvalidRequest("input_image data uri has no payload".to_string())
            })?;
            let mut meta = meta.split(';');
            let media_type = meta.next().unwrap_or_default().trim();
            if !meta.any(|param| param.trim().eq_ignore_ascii_case("base64")) {
                return Err(ImagegenError::InvalidRequest(
                    "input_image data uri must be base64 encoded".to_string(),
                ));
            }
            (Some(media_type), payload)
        }
        None => (None, raw),
    };

    let data = decode_base64(payload)?;
    if data.is_empty() {
        return Err(ImagegenError::InvalidRequest(
            "input_image is empty".to_string(),
        ));
    }
    let media_type = match declared.filter(|media_type| !media_type.is_empty()) {
        Some(declared) => allowed_media_type(declared),
        None => sniff_media_type(&data),
    }
    .ok_or_else(unsupported_format)?;
    Ok(ImageInput::new(data, media_type))
}

/// Resolves an uploaded file's media type from its header, then its filename, then its bytes.
fn file_media_type(part: &FormPart) -> Option<&'static str> {
    part.content_type
        .as_deref()
        .and_then(allowed_media_type)
        .or_else(|| part.filename.as_deref().and_then(media_type_for_filename))
        .or_else(|| sniff_media_type(&part.data))
}

fn image_from_file_part(part: &FormPart) -> Result<Option<ImageInput>> {
    if part.data.is_empty() {
        return Ok(None);
    }
    let media_type = file_media_type(part).ok_or_else(unsupported_format)?;
    Ok(Some(ImageInput::new(part.data.clone(), media_type)))
}

fn string_field(name: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text.clone())),
        _ => Err(ImagegenError::InvalidRequest(format!(
            "{name} must be a string"
        ))),
    }
}

pub fn decode_json_body(body: &[u8]) -> Result<GenerationInput> {
    let value = serde_json::from_slice::<Value>(body)
        .map_err(|err| ImagegenError::InvalidRequest(format!("invalid json body: {err}")))?;
    let Value::Object(fields) = value else {
        return Err(ImagegenError::InvalidRequest(
            "json body must be an object".to_string(),
        ));
    };

    let mut input = GenerationInput::default();
    for (key, value) in fields {
        match key.as_str() {
            PROMPT_FIELD => input.prompt = string_field(PROMPT_FIELD, &value)?.unwrap_or_default(),
            PROVIDER_FIELD => input.provider_type = string_field(PROVIDER_FIELD, &value)?,
            IMAGE_FIELD => {
                input.input_image = string_field(IMAGE_FIELD, &value)?
                    .filter(|raw| !raw.trim().is_empty())
                    .map(|raw| decode_image_string(&raw))
                    .transpose()?;
            }
            _ => {
                input.options.insert(key, value);
            }
        }
    }
    Ok(input)
}

pub fn decode_multipart_body(content_type: &str, body: &Bytes) -> Result<GenerationInput> {
    let mut input = GenerationInput::default();
    for part in parse_form(content_type, body)? {
        match part.name.as_str() {
            IMAGE_FIELD if part.is_file() => input.input_image = image_from_file_part(&part)?,
            IMAGE_FIELD => {
                let raw = part.text()?;
                if !raw.trim().is_empty() {
                    input.input_image = Some(decode_image_string(&raw)?);
                }
            }
            PROMPT_FIELD => input.prompt = part.text()?,
            PROVIDER_FIELD => input.provider_type = Some(part.text()?),
            _ if part.is_file() => {
                tracing::debug!(field = %part.name, "ignoring unexpected file part");
            }
            _ => {
                let value = part.text()?;
                input.options.insert(part.name, Value::String(value));
            }
        }
    }
    Ok(input)
}

pub fn decode_urlencoded_body(body: &[u8]) -> Result<GenerationInput> {
    let mut input = GenerationInput::default();
    let mut options = OptionMap::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        match key.as_ref() {
            PROMPT_FIELD => input.prompt = value.into_owned(),
            PROVIDER_FIELD => input.provider_type = Some(value.into_owned()),
            IMAGE_FIELD if value.trim().is_empty() => {}
            IMAGE_FIELD => input.input_image = Some(decode_image_string(&value)?),
            _ => {
                options.insert(key.into_owned(), Value::String(value.into_owned()));
            }
        }
    }
    input.options = options;
    Ok(input)
}

/// Dispatches on the content type. Anything that is not a form is read as JSON.
pub fn decode_generation_body(content_type: Option<&str>, body: &Bytes) -> Result<GenerationInput> {
    match content_type {
        Some(content_type) if is_multipart(content_type) => {
            decode_multipart_body(content_type, body)
        }
        Some(content_type)
            if content_type
                .trim()
                .to_ascii_lowercase()
                .starts_with("application/x-www-form-urlencoded") =>
        {
            decode_urlencoded_body(body)
        }
        _ => decode_json_body(body),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedImage {
    /// A `data:` uri ready to send back as `input_image`.
    pub base64_image: String,
    pub file_size: usize,
    pub content_type: String,
}

pub fn decode_upload(content_type: Option<&str>, body: &Bytes) -> Result<UploadedImage> {
    let content_type = content_type
        .filter(|content_type| is_multipart(content_type))
        .ok_or_else(|| {
            ImagegenError::InvalidRequest("upload must be multipart/form-data".to_string())
        })?;
    let part = parse_form(content_type, body)?
        .into_iter()
        .find(|part| part.name == UPLOAD_FIELD)
        .ok_or_else(|| ImagegenError::InvalidRequest("no file was uploaded".to_string()))?;

    let filename = part.filename.as_deref().unwrap_or_default().trim();
    if filename.is_empty() {
        return Err(ImagegenError::InvalidRequest(
            "no file was selected".to_string(),
        ));
    }
    let by_extension = media_type_for_filename(filename).ok_or_else(unsupported_format)?;
    let media_type = part
        .content_type
        .as_deref()
        .and_then(allowed_media_type)
        .unwrap_or(by_extension);

    let image = ImageInput::new(part.data, media_type);
    Ok(UploadedImage {
        base64_image: image.to_data_uri(),
        file_size: image.data.len(),
        content_type: image.media_type,
    })
}
