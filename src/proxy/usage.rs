//! Usage extraction and degenerate-response detection for buffered bodies.

use serde_json::Value;

/// Normalized token counts reported by an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Read the counts from an object carrying `prompt_tokens`,
    /// `completion_tokens` and `total_tokens`. Missing fields count as zero.
    pub fn from_object(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let field = |name: &str| object.get(name).and_then(Value::as_u64).unwrap_or(0);
        Some(Self {
            prompt_tokens: field("prompt_tokens"),
            completion_tokens: field("completion_tokens"),
            total_tokens: field("total_tokens"),
        })
    }
}

/// Find usage in a decoded response body.
///
/// Checked in order: top-level `usage`, `data[0].usage` (embedding-style
/// payloads), then top-level `prompt_tokens`/`total_tokens`.
pub fn extract_usage(body: &Value) -> Option<TokenUsage> {
    if let Some(usage) = body.get("usage").and_then(TokenUsage::from_object) {
        return Some(usage);
    }
    if let Some(usage) = body
        .get("data")
        .and_then(|data| data.get(0))
        .and_then(|first| first.get("usage"))
        .and_then(TokenUsage::from_object)
    {
        return Some(usage);
    }
    if body.get("prompt_tokens").is_some() || body.get("total_tokens").is_some() {
        return TokenUsage::from_object(body);
    }
    None
}

/// Whether a successful-status response carries nothing worth returning.
///
/// `content_length` is the declared `Content-Length`, if any.
pub fn is_empty_response(content_length: Option<u64>, body: &[u8]) -> bool {
    if content_length == Some(0) || body.is_empty() {
        return true;
    }

    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        // Not JSON: only whitespace counts as empty
        return body.iter().all(u8::is_ascii_whitespace);
    };

    match &value {
        Value::Null => true,
        Value::Object(map) if map.is_empty() => true,
        Value::Array(items) if items.is_empty() => true,
        Value::String(s) if s.trim().is_empty() => true,
        _ => is_echo_without_generation(&value),
    }
}

/// A completion that reports zero generated tokens while echoing the prompt
/// count as the total.
fn is_echo_without_generation(body: &Value) -> bool {
    let Some(usage) = body.get("usage").and_then(Value::as_object) else {
        return false;
    };
    // Embedding usage has no completion count at all
    if !usage.contains_key("completion_tokens") {
        return false;
    }
    let Some(usage) = TokenUsage::from_object(&body["usage"]) else {
        return false;
    };
    usage.completion_tokens == 0
        && usage.total_tokens > 0
        && usage.total_tokens == usage.prompt_tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_top_level_usage() {
        let body = json!({
            "choices": [],
            "usage": {"prompt_tokens": 3, "completion_tokens": 7, "total_tokens": 10}
        });
        assert_eq!(
            extract_usage(&body),
            Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 7,
                total_tokens: 10,
            })
        );
    }

    #[test]
    fn test_extract_nested_data_usage() {
        let body = json!({
            "data": [{"embedding": [0.1], "usage": {"prompt_tokens": 4, "total_tokens": 4}}]
        });
        let usage = extract_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 4);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 4);
    }

    #[test]
    fn test_extract_flat_fields() {
        let body = json!({"prompt_tokens": 12, "total_tokens": 12});
        assert_eq!(extract_usage(&body).unwrap().total_tokens, 12);
    }

    #[test]
    fn test_top_level_usage_wins() {
        let body = json!({
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
            "data": [{"usage": {"prompt_tokens": 9, "total_tokens": 9}}],
            "total_tokens": 99
        });
        assert_eq!(extract_usage(&body).unwrap().total_tokens, 2);
    }

    #[test]
    fn test_no_usage() {
        assert_eq!(extract_usage(&json!({"object": "list", "data": []})), None);
        assert_eq!(extract_usage(&json!([1, 2, 3])), None);
    }

    #[test]
    fn test_empty_bodies() {
        assert!(is_empty_response(Some(0), b"{\"id\":1}"));
        assert!(is_empty_response(None, b""));
        assert!(is_empty_response(None, b"{}"));
        assert!(is_empty_response(None, b"[]"));
        assert!(is_empty_response(None, b"null"));
        assert!(is_empty_response(None, b"\"   \""));
        assert!(is_empty_response(None, b"  \n "));
    }

    #[test]
    fn test_non_empty_bodies() {
        assert!(!is_empty_response(Some(13), b"{\"id\":\"abc\"}"));
        assert!(!is_empty_response(None, b"[1]"));
        assert!(!is_empty_response(None, b"plain text"));
        assert!(!is_empty_response(None, b"\"ok\""));
    }

    #[test]
    fn test_echo_without_generation_is_empty() {
        let body = br#"{"choices":[{"message":{"content":""}}],"usage":{"prompt_tokens":5,"completion_tokens":0,"total_tokens":5}}"#;
        assert!(is_empty_response(None, body));
    }

    #[test]
    fn test_normal_completion_is_not_empty() {
        let body = br#"{"choices":[{"message":{"content":"hi"}}],"usage":{"prompt_tokens":3,"completion_tokens":7,"total_tokens":10}}"#;
        assert!(!is_empty_response(None, body));
    }

    #[test]
    fn test_embedding_usage_is_not_empty() {
        let body = br#"{"object":"list","data":[{"embedding":[0.1]}],"usage":{"prompt_tokens":5,"total_tokens":5}}"#;
        assert!(!is_empty_response(None, body));
    }

    #[test]
    fn test_all_zero_usage_is_not_echo() {
        let body = br#"{"choices":[{}],"usage":{"prompt_tokens":0,"completion_tokens":0,"total_tokens":0}}"#;
        assert!(!is_empty_response(None, body));
    }
}
