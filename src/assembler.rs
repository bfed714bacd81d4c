//! Builds the outbound request handed to the relay engine.

use std::fmt;
use std::sync::Arc;

use http::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use url::Url;

use crate::config::RelayConfig;
use crate::error::{GatewayError, Result};
use crate::models::chat::ChatCompletionRequest;
use crate::route::RouteParameters;
use crate::tokens::TokenCounter;

/// Streaming vs buffered relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Buffered,
    Streaming,
}

impl DeliveryMode {
    pub fn from_stream_flag(stream: Option<bool>) -> Self {
        if stream.unwrap_or(false) {
            DeliveryMode::Streaming
        } else {
            DeliveryMode::Buffered
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, DeliveryMode::Streaming)
    }
}

/// Everything the relay engine needs; no back-reference to the inbound request.
#[derive(Clone)]
pub struct AssembledRequest {
    pub upstream_url: Url,
    pub request_body: Value,
    pub headers: HeaderMap,
    /// The request declares tools or functions.
    pub has_function_call: bool,
    pub prompt_tokens: u64,
    pub delivery_mode: DeliveryMode,
    pub model: String,
}

impl fmt::Debug for AssembledRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header_names: Vec<&str> = self.headers.keys().map(|k| k.as_str()).collect();
        f.debug_struct("AssembledRequest")
            .field("upstream_url", &self.upstream_url.as_str())
            .field("headers", &header_names)
            .field("has_function_call", &self.has_function_call)
            .field("prompt_tokens", &self.prompt_tokens)
            .field("delivery_mode", &self.delivery_mode)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct RequestAssembler {
    counter: Arc<dyn TokenCounter>,
    relay: RelayConfig,
}

impl RequestAssembler {
    pub fn new(counter: Arc<dyn TokenCounter>, relay: RelayConfig) -> Self {
        Self { counter, relay }
    }

    pub fn counter(&self) -> &Arc<dyn TokenCounter> {
        &self.counter
    }

    /// Combine the validated request, route and upstream credential headers.
    ///
    /// Pure data transformation. The only failure is a validated request
    /// that cannot be re-serialized, which is an internal fault.
    pub fn assemble(
        &self,
        request: &ChatCompletionRequest,
        route: &RouteParameters,
        credential_headers: HeaderMap,
    ) -> Result<AssembledRequest> {
        let delivery_mode = DeliveryMode::from_stream_flag(request.stream);

        let mut request_body = serde_json::to_value(request).map_err(|e| {
            GatewayError::Internal(format!("validated request failed to serialize: {e}"))
        })?;
        if delivery_mode.is_streaming() && self.relay.stream_include_usage {
            if let Some(obj) = request_body.as_object_mut() {
                obj.entry("stream_options")
                    .or_insert_with(|| json!({ "include_usage": true }));
            }
        }

        let mut headers = HeaderMap::new();
        if let Some(auth) = credential_headers.get(AUTHORIZATION) {
            headers.insert(AUTHORIZATION, auth.clone());
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if delivery_mode.is_streaming() {
            headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        } else {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        let prompt_tokens = self.count_prompt_tokens(request);

        Ok(AssembledRequest {
            upstream_url: route.url.clone(),
            request_body,
            headers,
            has_function_call: request.declares_tools(),
            prompt_tokens,
            delivery_mode,
            model: request.model.clone(),
        })
    }

    /// Token count over the concatenated message contents. Independent of `stream`.
    pub fn count_prompt_tokens(&self, request: &ChatCompletionRequest) -> u64 {
        self.counter.count_tokens(&request.model, &request.prompt_text()) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{RouteQuery, RouteResolver};
    use crate::tokens::WhitespaceCounter;
    use crate::validation::validate_value;

    fn assembler(relay: RelayConfig) -> RequestAssembler {
        RequestAssembler::new(Arc::new(WhitespaceCounter), relay)
    }

    fn route() -> RouteParameters {
        RouteResolver::default()
            .resolve(&RouteQuery::new("api.openai.com", "/v1/chat/completions"))
            .unwrap()
    }

    fn creds() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-upstream"));
        h
    }

    #[test]
    fn assembles_self_describing_request() {
        let req = validate_value(&json!({
            "model": "gpt-3.5-turbo",
            "messages": [{"role": "user", "content": "Hello, how are you?"}]
        }))
        .unwrap();
        let out = assembler(RelayConfig::default())
            .assemble(&req, &route(), creds())
            .unwrap();

        assert_eq!(
            out.upstream_url.as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(out.request_body["model"], "gpt-3.5-turbo");
        assert_eq!(out.request_body["messages"][0]["content"], "Hello, how are you?");
        assert!(out.request_body.get("stream").is_none());
        assert_eq!(out.headers[AUTHORIZATION], "Bearer sk-upstream");
        assert_eq!(out.headers[CONTENT_TYPE], "application/json");
        assert!(!out.has_function_call);
        assert_eq!(out.prompt_tokens, 4);
        assert_eq!(out.delivery_mode, DeliveryMode::Buffered);
    }

    #[test]
    fn preserves_stream_max_tokens_and_tools() {
        let req = validate_value(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "weather in Paris"}],
            "stream": true,
            "max_tokens": 50,
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}],
            "top_p": 0.5
        }))
        .unwrap();
        let out = assembler(RelayConfig::default())
            .assemble(&req, &route(), creds())
            .unwrap();
        assert_eq!(out.request_body["stream"], true);
        assert_eq!(out.request_body["max_tokens"], 50);
        assert_eq!(out.request_body["top_p"], 0.5);
        assert_eq!(out.request_body["tools"][0]["function"]["name"], "get_weather");
        assert!(out.request_body.get("stream_options").is_none());
        assert!(out.has_function_call);
        assert_eq!(out.delivery_mode, DeliveryMode::Streaming);
        assert_eq!(out.headers[ACCEPT], "text/event-stream");
    }

    #[test]
    fn prompt_tokens_do_not_depend_on_stream_flag() {
        let a = assembler(RelayConfig::default());
        let base = json!({
            "model": "m",
            "messages": [
                {"role": "system", "content": "be kind"},
                {"role": "user", "content": "tell me a joke"}
            ]
        });
        let mut streaming = base.clone();
        streaming["stream"] = json!(true);

        let buffered = a
            .assemble(&validate_value(&base).unwrap(), &route(), creds())
            .unwrap();
        let streamed = a
            .assemble(&validate_value(&streaming).unwrap(), &route(), creds())
            .unwrap();
        let again = a
            .assemble(&validate_value(&base).unwrap(), &route(), creds())
            .unwrap();
        assert_eq!(buffered.prompt_tokens, 6);
        assert_eq!(buffered.prompt_tokens, streamed.prompt_tokens);
        assert_eq!(buffered.prompt_tokens, again.prompt_tokens);
    }

    #[test]
    fn prompt_tokens_use_the_request_model_encoding() {
        let text = "Grüße aus München! こんにちは、世界。Привет, как дела? 🚀 naïve café";
        let a = RequestAssembler::new(
            Arc::new(crate::tokens::TiktokenCounter::default()),
            RelayConfig::default(),
        );
        let req = validate_value(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": text}]
        }))
        .unwrap();
        let out = a.assemble(&req, &route(), creds()).unwrap();

        let o200k = tiktoken_rs::o200k_base_singleton()
            .encode_with_special_tokens(text)
            .len() as u64;
        let cl100k = tiktoken_rs::cl100k_base_singleton()
            .encode_with_special_tokens(text)
            .len() as u64;
        assert_eq!(out.prompt_tokens, o200k);
        assert_ne!(out.prompt_tokens, cl100k);
    }

    #[test]
    fn include_usage_injected_only_when_absent() {
        let a = assembler(RelayConfig {
            stream_include_usage: true,
            ..RelayConfig::default()
        });
        let req = validate_value(&json!({
            "model": "m", "stream": true,
            "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        let out = a.assemble(&req, &route(), creds()).unwrap();
        assert_eq!(out.request_body["stream_options"]["include_usage"], true);

        let req = validate_value(&json!({
            "model": "m", "stream": true,
            "stream_options": {"include_usage": false},
            "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        let out = a.assemble(&req, &route(), creds()).unwrap();
        assert_eq!(out.request_body["stream_options"]["include_usage"], false);
    }

    #[test]
    fn debug_output_hides_credentials() {
        let req = validate_value(&json!({
            "model": "m", "messages": [{"role": "user", "content": "x"}]
        }))
        .unwrap();
        let out = assembler(RelayConfig::default())
            .assemble(&req, &route(), creds())
            .unwrap();
        let dbg = format!("{out:?}");
        assert!(!dbg.contains("sk-upstream"));
        assert!(dbg.contains("authorization"));
    }
}
