//! Inbound request validation.
//!
//! The structural checks run on the raw JSON value first so the error names
//! the first violated constraint precisely (`messages[2].role ...`) instead of
//! surfacing a generic serde message. Only then is the payload decoded into
//! [`ChatCompletionRequest`].

use serde_json::Value;

use crate::error::{GatewayError, Result};
use crate::models::chat::{ChatCompletionRequest, Role};

/// Validate a raw request body.
pub fn validate(raw: &[u8]) -> Result<ChatCompletionRequest> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(GatewayError::Validation(
            "request body must not be empty".into(),
        ));
    }
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| GatewayError::Validation(format!("request body is not valid JSON: {e}")))?;
    validate_value(&value)
}

/// Validate an already-parsed JSON payload.
pub fn validate_value(value: &Value) -> Result<ChatCompletionRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("request body must be a JSON object"))?;

    match obj.get("model") {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::String(_)) => return Err(invalid("model must not be empty")),
        Some(_) => return Err(invalid("model must be a string")),
        None => return Err(invalid("missing required field: model")),
    }

    let messages = match obj.get("messages") {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(invalid("messages must be an array")),
        None => return Err(invalid("missing required field: messages")),
    };
    if messages.is_empty() {
        return Err(invalid("messages must contain at least one message"));
    }
    for (idx, message) in messages.iter().enumerate() {
        check_message(idx, message)?;
    }

    if let Some(stream) = obj.get("stream") {
        if !stream.is_boolean() && !stream.is_null() {
            return Err(invalid("stream must be a boolean"));
        }
    }
    if let Some(max_tokens) = obj.get("max_tokens") {
        if !max_tokens.is_null() && max_tokens.as_u64().and_then(|n| u32::try_from(n).ok()).is_none() {
            return Err(invalid("max_tokens must be a non-negative integer"));
        }
    }
    for key in ["tools", "functions"] {
        if let Some(v) = obj.get(key) {
            if !v.is_array() && !v.is_null() {
                return Err(invalid(&format!("{key} must be an array")));
            }
        }
    }

    serde_json::from_value::<ChatCompletionRequest>(value.clone())
        .map_err(|e| GatewayError::Validation(format!("invalid chat completion request: {e}")))
}

fn check_message(idx: usize, message: &Value) -> Result<()> {
    let obj = message
        .as_object()
        .ok_or_else(|| invalid(&format!("messages[{idx}] must be an object")))?;

    let role = match obj.get("role") {
        Some(Value::String(r)) => Role::parse(r).ok_or_else(|| {
            invalid(&format!("messages[{idx}].role '{r}' is not a recognized role"))
        })?,
        Some(_) => return Err(invalid(&format!("messages[{idx}].role must be a string"))),
        None => return Err(invalid(&format!("messages[{idx}] is missing role"))),
    };

    let has_tool_calls = obj
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .is_some_and(|calls| !calls.is_empty());

    match obj.get("content") {
        Some(Value::String(_)) | Some(Value::Array(_)) => Ok(()),
        None | Some(Value::Null) if role == Role::Assistant && has_tool_calls => Ok(()),
        None | Some(Value::Null) => Err(invalid(&format!(
            "messages[{idx}] is missing content"
        ))),
        Some(_) => Err(invalid(&format!(
            "messages[{idx}].content must be a string or an array of content parts"
        ))),
    }
}

fn invalid(msg: &str) -> GatewayError {
    GatewayError::Validation(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_of(err: GatewayError) -> String {
        match err {
            GatewayError::Validation(m) => m,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_minimal_request() {
        let req = validate(br#"{"model":"gpt-3.5-turbo","messages":[{"role":"user","content":"Hello!"}]}"#)
            .expect("valid");
        assert_eq!(req.model, "gpt-3.5-turbo");
        assert!(!req.is_stream());
    }

    #[test]
    fn rejects_non_json_and_empty_bodies() {
        assert!(message_of(validate(b"").unwrap_err()).contains("empty"));
        assert!(message_of(validate(b"{not json").unwrap_err()).contains("not valid JSON"));
        assert!(message_of(validate(b"[1,2]").unwrap_err()).contains("JSON object"));
    }

    #[test]
    fn rejects_missing_or_blank_model() {
        let err = validate_value(&json!({"messages": [{"role": "user", "content": "x"}]}));
        assert_eq!(message_of(err.unwrap_err()), "missing required field: model");

        let err = validate_value(&json!({"model": "  ", "messages": [{"role": "user", "content": "x"}]}));
        assert_eq!(message_of(err.unwrap_err()), "model must not be empty");
    }

    #[test]
    fn rejects_empty_messages() {
        let err = validate_value(&json!({"model": "m", "messages": []})).unwrap_err();
        assert_eq!(message_of(err), "messages must contain at least one message");
    }

    #[test]
    fn reports_first_bad_role() {
        let err = validate_value(&json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "ok"},
                {"role": "robot", "content": "beep"},
                {"role": "wizard", "content": "zap"}
            ]
        }))
        .unwrap_err();
        assert_eq!(
            message_of(err),
            "messages[1].role 'robot' is not a recognized role"
        );
    }

    #[test]
    fn content_required_except_for_assistant_tool_calls() {
        let err = validate_value(&json!({
            "model": "m",
            "messages": [{"role": "user"}]
        }))
        .unwrap_err();
        assert_eq!(message_of(err), "messages[0] is missing content");

        let ok = validate_value(&json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "get_weather", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ]
        }));
        assert!(ok.is_ok());
    }

    #[test]
    fn rejects_bad_optional_field_types() {
        let base = |extra: Value| {
            let mut v = json!({"model": "m", "messages": [{"role": "user", "content": "x"}]});
            for (k, val) in extra.as_object().unwrap() {
                v[k] = val.clone();
            }
            v
        };
        assert_eq!(
            message_of(validate_value(&base(json!({"stream": "yes"}))).unwrap_err()),
            "stream must be a boolean"
        );
        assert_eq!(
            message_of(validate_value(&base(json!({"max_tokens": -5}))).unwrap_err()),
            "max_tokens must be a non-negative integer"
        );
        assert_eq!(
            message_of(validate_value(&base(json!({"tools": {"a": 1}}))).unwrap_err()),
            "tools must be an array"
        );
    }

    #[test]
    fn revalidation_is_idempotent() {
        let raw = json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "You are terse."},
                {"role": "user", "content": [{"type": "text", "text": "Hi"}]}
            ],
            "stream": true,
            "max_tokens": 50,
            "temperature": 0.2,
            "tools": [{"type": "function", "function": {"name": "f", "parameters": {}}}]
        });
        let first = validate_value(&raw).unwrap();
        let reserialized = serde_json::to_vec(&first).unwrap();
        let second = validate(&reserialized).unwrap();
        assert_eq!(first, second);
        let third = validate(&serde_json::to_vec(&second).unwrap()).unwrap();
        assert_eq!(second, third);
    }
}
