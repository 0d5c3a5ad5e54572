//! Buffered `multipart/form-data` decoding.

use bytes::Bytes;

use crate::{ImagegenError, Result};

#[derive(Debug, Clone)]
pub(crate) struct FormPart {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) data: Bytes,
}

impl FormPart {
    pub(crate) fn is_file(&self) -> bool {
        self.filename.is_some()
    }

    pub(crate) fn text(&self) -> Result<String> {
        String::from_utf8(self.data.to_vec()).map_err(|_| {
            ImagegenError::InvalidRequest(format!("form field {:?} is not valid utf-8", self.name))
        })
    }
}

fn invalid(reason: &str) -> ImagegenError {
    ImagegenError::InvalidRequest(format!("malformed multipart body: {reason}"))
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start);
    }
    if start >= haystack.len() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|rel| start + rel)
}

fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').map(str::trim).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.trim().is_empty()).then(|| value.to_string())
    })
}

pub(crate) fn is_multipart(content_type: &str) -> bool {
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("multipart/form-data")
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
        .to_string()
}

fn skip_line_break(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

pub(crate) fn parse_form(content_type: &str, body: &Bytes) -> Result<Vec<FormPart>> {
    let boundary = boundary(content_type).ok_or_else(|| invalid("boundary is missing"))?;
    let marker = format!("--{boundary}");
    let marker = marker.as_bytes();
    // A part ends at `\n--boundary`; the preceding `\r`, when present, belongs to the line break.
    let delimiter = [b"\n".as_slice(), marker].concat();

    let bytes = body.as_ref();
    let mut cursor = find_subslice(bytes, marker, 0)
        .ok_or_else(|| invalid("boundary marker not found"))?
        + marker.len();

    let mut parts = Vec::<FormPart>::new();
    loop {
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        cursor = skip_line_break(bytes, cursor);

        let crlf = find_subslice(bytes, b"\r\n\r\n", cursor).map(|idx| (idx, 4));
        let lf = find_subslice(bytes, b"\n\n", cursor).map(|idx| (idx, 2));
        let (headers_end, separator_len) = crlf
            .into_iter()
            .chain(lf)
            .min_by_key(|(idx, _)| *idx)
            .ok_or_else(|| invalid("part is missing its header separator"))?;

        let headers = String::from_utf8_lossy(&bytes[cursor..headers_end]);
        let mut name = None::<String>;
        let mut filename = None::<String>;
        let mut part_type = None::<String>;
        for line in headers.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if key.trim().eq_ignore_ascii_case("content-disposition") {
                for item in value.split(';').map(str::trim) {
                    if let Some(raw) = item.strip_prefix("name=") {
                        name = Some(unquote(raw));
                    } else if let Some(raw) = item.strip_prefix("filename=") {
                        filename = Some(unquote(raw));
                    }
                }
            } else if key.trim().eq_ignore_ascii_case("content-type") && !value.is_empty() {
                part_type = Some(value.to_string());
            }
        }
        let name = name.ok_or_else(|| invalid("part is missing a content-disposition name"))?;

        let data_start = headers_end + separator_len;
        let delimiter_at = find_subslice(bytes, &delimiter, data_start)
            .ok_or_else(|| invalid("part is missing its trailing boundary"))?;
        let data_end = if delimiter_at > data_start && bytes[delimiter_at - 1] == b'\r' {
            delimiter_at - 1
        } else {
            delimiter_at
        };
        parts.push(FormPart {
            name,
            filename,
            content_type: part_type,
            data: body.slice(data_start..data_end),
        });

        cursor = delimiter_at + delimiter.len();
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        cursor = skip_line_break(bytes, cursor);
    }

    Ok(parts)
}
