// ABOUTME: Extracts assistant text and token usage from raw provider response bodies.
// ABOUTME: Used at live ingest and again by the index rebuild so both paths agree.

use serde_json::Value;

use crate::exchange::TokenUsage;

/// Best-effort assistant text from a provider response body. Understands the
/// OpenAI, Anthropic, Gemini and Ollama response shapes. A body that is not
/// JSON is returned as-is; an empty body yields `None`.
pub fn extract_response_text(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }

    let json: Value = match serde_json::from_str(trimmed) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(error = %e, "response body is not JSON; using it verbatim");
            return Some(trimmed.to_string());
        }
    };

    let text = openai_text(&json)
        .or_else(|| anthropic_text(&json))
        .or_else(|| gemini_text(&json))
        .or_else(|| ollama_text(&json));

    match text {
        Some(t) if !t.is_empty() => Some(t),
        Some(_) => None,
        None => {
            if !json.is_string() {
                tracing::debug!("no known provider shape in response body");
            }
            json.as_str().map(String::from)
        }
    }
}

/// Token counts reported in a provider response body, if any.
pub fn extract_token_usage(body: &str) -> Option<TokenUsage> {
    let json: Value = serde_json::from_str(body.trim()).ok()?;

    if let Some(usage) = json.get("usage") {
        let prompt = int(usage, "prompt_tokens").or_else(|| int(usage, "input_tokens"));
        let completion = int(usage, "completion_tokens").or_else(|| int(usage, "output_tokens"));
        let total = int(usage, "total_tokens");
        return build_usage(prompt, completion, total);
    }

    if let Some(meta) = json.get("usageMetadata") {
        return build_usage(
            int(meta, "promptTokenCount"),
            int(meta, "candidatesTokenCount"),
            int(meta, "totalTokenCount"),
        );
    }

    // Ollama reports counts at the top level.
    build_usage(
        int(&json, "prompt_eval_count"),
        int(&json, "eval_count"),
        None,
    )
}

fn build_usage(prompt: Option<i64>, completion: Option<i64>, total: Option<i64>) -> Option<TokenUsage> {
    if prompt.is_none() && completion.is_none() && total.is_none() {
        return None;
    }
    let usage = TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    };
    Some(TokenUsage {
        total_tokens: usage.resolved_total(),
        ..usage
    })
}

fn int(value: &Value, key: &str) -> Option<i64> {
    value.get(key).and_then(Value::as_i64)
}

fn openai_text(json: &Value) -> Option<String> {
    let choices = json.get("choices")?.as_array()?;
    let parts: Vec<&str> = choices
        .iter()
        .filter_map(|c| {
            c.get("message")
                .and_then(|m| m.get("content"))
                .and_then(Value::as_str)
                .or_else(|| c.get("text").and_then(Value::as_str))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

fn anthropic_text(json: &Value) -> Option<String> {
    let content = json.get("content")?.as_array()?;
    let parts: Vec<&str> = content
        .iter()
        .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|item| item.get("text").and_then(Value::as_str))
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(""))
    }
}

fn gemini_text(json: &Value) -> Option<String> {
    let candidates = json.get("candidates")?.as_array()?;
    let first = candidates.first()?;
    let parts = first.get("content")?.get("parts")?.as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join(""))
    }
}

fn ollama_text(json: &Value) -> Option<String> {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .or_else(|| json.get("response").and_then(Value::as_str))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_chat_completion() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"Hi there"}}],
            "usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        assert_eq!(extract_response_text(body).as_deref(), Some("Hi there"));
        let usage = extract_token_usage(body).unwrap();
        assert_eq!(usage, TokenUsage::new(3, 5));
    }

    #[test]
    fn anthropic_message() {
        let body = r#"{"content":[{"type":"text","text":"Hello, "},{"type":"tool_use","name":"x"},{"type":"text","text":"world"}],
            "usage":{"input_tokens":10,"output_tokens":4}}"#;
        assert_eq!(extract_response_text(body).as_deref(), Some("Hello, world"));
        let usage = extract_token_usage(body).unwrap();
        assert_eq!(usage.total_tokens, Some(14));
    }

    #[test]
    fn gemini_candidates() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"A"},{"text":"B"}]}}],
            "usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":1,"totalTokenCount":3}}"#;
        assert_eq!(extract_response_text(body).as_deref(), Some("AB"));
        assert_eq!(extract_token_usage(body).unwrap().total_tokens, Some(3));
    }

    #[test]
    fn ollama_generate() {
        let body = r#"{"response":"ok","prompt_eval_count":7,"eval_count":2}"#;
        assert_eq!(extract_response_text(body).as_deref(), Some("ok"));
        assert_eq!(extract_token_usage(body).unwrap().total_tokens, Some(9));
    }

    #[test]
    fn plain_text_body_passes_through() {
        assert_eq!(extract_response_text("  just text ").as_deref(), Some("just text"));
        assert_eq!(extract_response_text(""), None);
        assert!(extract_token_usage("just text").is_none());
    }

    #[test]
    fn json_without_known_shape_has_no_text() {
        assert_eq!(extract_response_text(r#"{"error":"rate limited"}"#), None);
        assert!(extract_token_usage(r#"{"error":"rate limited"}"#).is_none());
    }
}
