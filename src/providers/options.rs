//! Typed readers over the loosely typed option map.
//!
//! Multipart forms deliver every field as a string while JSON bodies carry real scalars, so
//! each reader accepts both spellings.

use serde_json::Value;

use crate::types::OptionMap;
use crate::{ImagegenError, Result};

/// Blank strings and `null` read as absent.
pub(crate) fn option_string(
    provider: &str,
    options: &OptionMap,
    key: &str,
) -> Result<Option<String>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.trim().to_string()).filter(|t| !t.is_empty())),
        Some(Value::Number(number)) => Ok(Some(number.to_string())),
        Some(Value::Bool(flag)) => Ok(Some(flag.to_string())),
        Some(other) => Err(ImagegenError::invalid_options(
            provider,
            format!("{key} must be a scalar, got {other}"),
        )),
    }
}

pub(crate) fn option_choice(
    provider: &str,
    options: &OptionMap,
    key: &str,
    allowed: &[&str],
) -> Result<Option<String>> {
    let Some(value) = option_string(provider, options, key)? else {
        return Ok(None);
    };
    if allowed.contains(&value.as_str()) {
        return Ok(Some(value));
    }
    Err(ImagegenError::invalid_options(
        provider,
        format!("{key} must be one of {}, got {value:?}", allowed.join(", ")),
    ))
}

pub(crate) fn option_bool(provider: &str, options: &OptionMap, key: &str) -> Result<Option<bool>> {
    match options.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(flag)) => Ok(Some(*flag)),
        Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            other => Err(ImagegenError::invalid_options(
                provider,
                format!("{key} must be a boolean, got {other:?}"),
            )),
        },
        Some(other) => Err(ImagegenError::invalid_options(
            provider,
            format!("{key} must be a boolean, got {other}"),
        )),
    }
}

pub(crate) fn option_int_in_range(
    provider: &str,
    options: &OptionMap,
    key: &str,
    min: i64,
    max: i64,
) -> Result<Option<i64>> {
    let Some(raw) = option_string(provider, options, key)? else {
        return Ok(None);
    };
    let value = raw.parse::<i64>().map_err(|_| {
        ImagegenError::invalid_options(provider, format!("{key} must be an integer, got {raw:?}"))
    })?;
    if !(min..=max).contains(&value) {
        return Err(ImagegenError::invalid_options(
            provider,
            format!("{key} must be between {min} and {max}, got {value}"),
        ));
    }
    Ok(Some(value))
}

/// Unparseable values are dropped rather than rejected.
pub(crate) fn option_int_lenient(options: &OptionMap, key: &str) -> Option<i64> {
    match options.get(key)? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}
