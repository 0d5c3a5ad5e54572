use futures_util::StreamExt;
use serde_json::Value;

pub(crate) const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

pub(crate) async fn response_text_truncated(
    response: reqwest::Response,
    max_bytes: usize,
) -> String {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::<u8>::new();
    let mut truncated = false;

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let Ok(chunk) = next else {
            break;
        };
        let remaining = max_bytes.saturating_sub(out.len());
        if chunk.len() <= remaining {
            out.extend_from_slice(chunk.as_ref());
        } else {
            out.extend_from_slice(&chunk.as_ref()[..remaining]);
            truncated = true;
            break;
        }
    }

    let mut body = String::from_utf8_lossy(&out).to_string();
    if truncated {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str("...(truncated)");
    }
    body
}

/// Pulls a human-readable message out of a JSON error body.
///
/// Each pointer is tried in order; string values win, other JSON is rendered compactly.
pub(crate) fn error_detail(body: &str, pointers: &[&str]) -> Option<String> {
    let parsed = serde_json::from_str::<Value>(body).ok()?;
    pointers.iter().find_map(|pointer| {
        match parsed.pointer(pointer)? {
            Value::Null => None,
            Value::String(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
            other => Some(other.to_string()),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_detail_prefers_first_matching_pointer() {
        let body = r#"{"detail":"bad seed","error":{"message":"nested"}}"#;
        assert_eq!(
            error_detail(body, &["/error/message", "/detail"]).as_deref(),
            Some("nested")
        );
        assert_eq!(error_detail(body, &["/detail"]).as_deref(), Some("bad seed"));
    }

    #[test]
    fn error_detail_renders_structured_values() {
        let body = r#"{"detail":[{"loc":["body","prompt"],"msg":"field required"}]}"#;
        let detail = error_detail(body, &["/detail"]).unwrap_or_default();
        assert!(detail.contains("field required"));
    }

    #[test]
    fn error_detail_ignores_non_json_and_blank() {
        assert_eq!(error_detail("<html>502</html>", &["/detail"]), None);
        assert_eq!(error_detail(r#"{"detail":"  "}"#, &["/detail"]), None);
        assert_eq!(error_detail(r#"{"detail":null}"#, &["/detail"]), None);
    }
}
