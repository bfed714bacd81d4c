//! Upstream dispatch and response relay.
//!
//! [`RelayEngine::relay`] issues exactly one upstream call and returns either a
//! buffered JSON response or a [`FragmentStream`] of SSE events. The stream
//! re-frames upstream bytes into whole events and yields each one as soon as
//! it is complete, so memory stays bounded by a single event. Dropping the
//! stream (for example when the client disconnects) drops the upstream body,
//! which cancels the upstream request and returns its connection to the pool.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::TryStreamExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::assembler::{AssembledRequest, DeliveryMode};
use crate::config::RelayConfig;
use crate::error::{ErrorEnvelope, ErrorKind, GatewayError, Result};
use crate::models::chat::{ChoiceBody, Usage};
use crate::tokens::TokenCounter;

/// Events larger than this are forwarded unparsed instead of growing the buffer.
const MAX_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// Lifecycle of one relayed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Idle,
    Dispatched,
    NonStreamingComplete,
    StreamingActive,
    StreamingComplete,
    Aborted,
}

/// A fully received upstream completion.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Upstream JSON body, with `usage` guaranteed present.
    pub body: Value,
    pub choice: ChoiceBody,
    pub usage: Usage,
    /// `usage` was computed locally because the upstream omitted it.
    pub usage_synthesized: bool,
    pub phase: RelayPhase,
}

impl BufferedResponse {
    pub fn is_function_call(&self) -> bool {
        self.choice.is_function_call()
    }
}

pub enum RelayOutcome {
    Buffered(BufferedResponse),
    Streaming(FragmentStream),
}

impl RelayOutcome {
    pub fn is_streaming(&self) -> bool {
        matches!(self, RelayOutcome::Streaming(_))
    }
}

impl std::fmt::Debug for RelayOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayOutcome::Buffered(b) => f.debug_tuple("Buffered").field(b).finish(),
            RelayOutcome::Streaming(s) => f.debug_tuple("Streaming").field(&s.phase()).finish(),
        }
    }
}

#[derive(Clone)]
pub struct RelayEngine {
    http: reqwest::Client,
    counter: Arc<dyn TokenCounter>,
    config: RelayConfig,
}

impl RelayEngine {
    pub fn new(http: reqwest::Client, counter: Arc<dyn TokenCounter>, config: RelayConfig) -> Self {
        Self {
            http,
            counter,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Dispatch the assembled request and relay the upstream response.
    ///
    /// Non-2xx upstream statuses surface as [`GatewayError::Upstream`]; nothing
    /// is retried, since completions are not idempotent.
    pub async fn relay(&self, request: AssembledRequest) -> Result<RelayOutcome> {
        let mut phase = RelayPhase::Idle;
        debug!(
            upstream = %request.upstream_url,
            model = %request.model,
            stream = request.delivery_mode.is_streaming(),
            "dispatching upstream request"
        );

        let upstream = self
            .http
            .post(request.upstream_url.clone())
            .headers(request.headers.clone())
            .json(&request.request_body)
            .send()
            .await
            .map_err(|e| {
                warn!(upstream = %request.upstream_url, error = %e, "upstream dispatch failed");
                GatewayError::from(e)
            })?;
        advance(&mut phase, RelayPhase::Dispatched);

        let status = upstream.status();
        if !status.is_success() {
            advance(&mut phase, RelayPhase::Aborted);
            let bytes = match upstream.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        upstream = %request.upstream_url,
                        status = status.as_u16(),
                        error = %e.without_url(),
                        "failed to read upstream error body"
                    );
                    Bytes::new()
                }
            };
            let err = GatewayError::from_upstream(status.as_u16(), &bytes);
            info!(
                upstream = %request.upstream_url,
                status = status.as_u16(),
                error = %err,
                "upstream rejected request"
            );
            return Err(err);
        }

        let content_type = upstream
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match request.delivery_mode {
            DeliveryMode::Streaming if !is_json_content_type(content_type.as_deref()) => {
                advance(&mut phase, RelayPhase::StreamingActive);
                let body = upstream
                    .bytes_stream()
                    .map_err(|e| std::io::Error::other(e.to_string()));
                let stream = FragmentStream::new(
                    body,
                    StreamContext {
                        model: request.model.clone(),
                        prompt_tokens: request.prompt_tokens,
                        counter: self.counter.clone(),
                        usage_fallback: self.config.stream_usage_fallback,
                    },
                );
                Ok(RelayOutcome::Streaming(stream))
            }
            mode => {
                if mode.is_streaming() {
                    debug!("upstream answered a streaming request with JSON; relaying buffered");
                }
                let bytes = upstream.bytes().await.map_err(|e| GatewayError::Upstream {
                    status: 502,
                    message: format!("failed to read upstream response: {}", e.without_url()),
                })?;
                let buffered = finish_buffered(
                    status.as_u16(),
                    content_type,
                    &bytes,
                    &request.model,
                    request.prompt_tokens,
                    self.counter.as_ref(),
                )?;
                advance(&mut phase, buffered.phase);
                debug!(
                    function_call = buffered.is_function_call(),
                    prompt_tokens = buffered.usage.prompt_tokens,
                    completion_tokens = buffered.usage.completion_tokens,
                    usage_synthesized = buffered.usage_synthesized,
                    "buffered relay complete"
                );
                Ok(RelayOutcome::Buffered(buffered))
            }
        }
    }
}

fn advance(phase: &mut RelayPhase, next: RelayPhase) {
    debug!(from = ?*phase, to = ?next, "relay phase");
    *phase = next;
}

fn is_json_content_type(ct: Option<&str>) -> bool {
    ct.map(|s| s.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false)
}

/// Parse and check a complete upstream body; attach `usage` if missing.
pub fn finish_buffered(
    status: u16,
    content_type: Option<String>,
    bytes: &[u8],
    model: &str,
    prompt_tokens: u64,
    counter: &dyn TokenCounter,
) -> Result<BufferedResponse> {
    let mut body: Value = serde_json::from_slice(bytes).map_err(|_| GatewayError::Upstream {
        status: 502,
        message: "upstream returned a non-JSON body".into(),
    })?;

    let message = body
        .get("choices")
        .and_then(|c| c.as_array())
        .filter(|c| !c.is_empty())
        .ok_or_else(|| GatewayError::Upstream {
            status: 502,
            message: "upstream response has no choices".into(),
        })?
        .first()
        .and_then(|c| c.get("message"))
        .filter(|m| m.is_object())
        .ok_or_else(|| GatewayError::Upstream {
            status: 502,
            message: "upstream choice has no message".into(),
        })?;
    let choice = ChoiceBody::from_message(message);

    let upstream_usage = body.get("usage").and_then(Usage::from_value);
    let usage_synthesized = upstream_usage.is_none();
    let usage = upstream_usage.unwrap_or_else(|| {
        let completion = match &choice {
            ChoiceBody::Content(text) => counter.count_tokens(model, text) as u64,
            ChoiceBody::ToolCalls(_) => 0,
        };
        Usage::new(prompt_tokens, completion)
    });
    if usage_synthesized {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("usage".into(), json!(usage));
        }
    }

    Ok(BufferedResponse {
        status,
        content_type,
        body,
        choice,
        usage,
        usage_synthesized,
        phase: RelayPhase::NonStreamingComplete,
    })
}

/// Inputs the stream needs for on-the-fly accounting.
pub struct StreamContext {
    pub model: String,
    pub prompt_tokens: u64,
    pub counter: Arc<dyn TokenCounter>,
    pub usage_fallback: bool,
}

type ByteStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Ordered SSE events relayed from the upstream.
///
/// Each item is one complete event (`data: ...\n\n`) exactly as the upstream
/// framed it. Ends after `data: [DONE]`, after an appended `relay_error`
/// event when the upstream connection fails, or at upstream EOF.
pub struct FragmentStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for an event delimiter.
    scanned: usize,
    pending: VecDeque<Bytes>,
    ctx: StreamContext,
    phase: RelayPhase,
    upstream_eof: bool,
    finished: bool,
    events: usize,
    saw_tool_calls: bool,
    saw_usage: bool,
    saw_done: bool,
    completion_tokens: u64,
    last_id: Option<String>,
}

impl FragmentStream {
    pub fn new<S>(inner: S, ctx: StreamContext) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static,
    {
        Self {
            inner: Box::pin(inner),
            buffer: Vec::new(),
            scanned: 0,
            pending: VecDeque::new(),
            ctx,
            phase: RelayPhase::StreamingActive,
            upstream_eof: false,
            finished: false,
            events: 0,
            saw_tool_calls: false,
            saw_usage: false,
            saw_done: false,
            completion_tokens: 0,
            last_id: None,
        }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    /// A streamed delta carried `tool_calls` (or a legacy `function_call`).
    pub fn saw_tool_calls(&self) -> bool {
        self.saw_tool_calls
    }

    pub fn saw_sentinel(&self) -> bool {
        self.saw_done
    }

    /// Events forwarded so far, sentinel included.
    pub fn events_forwarded(&self) -> usize {
        self.events
    }

    fn handle_event(&mut self, event: Vec<u8>) {
        self.events += 1;
        let data = event_data(&event);
        let Some(data) = data else {
            // comment / keep-alive / event-only lines
            self.pending.push_back(Bytes::from(event));
            return;
        };

        if trim_ascii(&data) == b"[DONE]" {
            if self.ctx.usage_fallback && !self.saw_usage {
                self.pending.push_back(Bytes::from(self.usage_event()));
            }
            self.pending.push_back(Bytes::from(event));
            self.saw_done = true;
            self.complete(RelayPhase::StreamingComplete);
            return;
        }

        if let Ok(chunk) = serde_json::from_slice::<Value>(&data) {
            self.inspect_chunk(&chunk);
        }
        self.pending.push_back(Bytes::from(event));
    }

    fn inspect_chunk(&mut self, chunk: &Value) {
        if let Some(id) = chunk.get("id").and_then(|v| v.as_str()) {
            if self.last_id.as_deref() != Some(id) {
                self.last_id = Some(id.to_string());
            }
        }
        if chunk.get("usage").is_some_and(|u| u.is_object()) {
            self.saw_usage = true;
        }
        if let Some(err) = chunk.get("error") {
            warn!(error = %err, "upstream sent an error event mid-stream");
        }
        let Some(choices) = chunk.get("choices").and_then(|c| c.as_array()) else {
            return;
        };
        for choice in choices {
            let Some(delta) = choice.get("delta") else {
                continue;
            };
            if delta.get("tool_calls").is_some_and(|t| t.is_array())
                || delta.get("function_call").is_some_and(|f| f.is_object())
            {
                self.saw_tool_calls = true;
            }
            if self.ctx.usage_fallback {
                if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                    self.completion_tokens +=
                        self.ctx.counter.count_tokens(&self.ctx.model, text) as u64;
                }
            }
        }
    }

    fn usage_event(&self) -> Vec<u8> {
        let usage = Usage::new(self.ctx.prompt_tokens, self.completion_tokens);
        let mut chunk = json!({
            "object": "chat.completion.chunk",
            "model": self.ctx.model,
            "choices": [],
            "usage": usage,
        });
        if let Some(id) = &self.last_id {
            chunk["id"] = json!(id);
        }
        sse_data_event(&chunk)
    }

    fn complete(&mut self, phase: RelayPhase) {
        self.finished = true;
        self.phase = phase;
        match phase {
            RelayPhase::StreamingComplete => info!(
                model = %self.ctx.model,
                events = self.events,
                tool_calls = self.saw_tool_calls,
                "stream relay complete"
            ),
            _ => warn!(
                model = %self.ctx.model,
                events = self.events,
                sentinel = self.saw_done,
                "stream relay ended without completion marker"
            ),
        }
    }

    fn abort_with_error(&mut self, err: std::io::Error) {
        warn!(error = %err, events = self.events, "upstream stream failed mid-relay");
        let envelope = ErrorEnvelope::new(
            502,
            ErrorKind::RelayError,
            format!("upstream stream interrupted: {err}"),
        );
        // whatever partial event was buffered is discarded; it was never sent
        self.buffer.clear();
        self.pending.push_back(Bytes::from(envelope.to_sse_event()));
        self.complete(RelayPhase::Aborted);
    }
}

impl Stream for FragmentStream {
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if this.finished {
                return Poll::Ready(None);
            }

            if let Some(end) = find_event_end(&this.buffer, this.scanned) {
                let event: Vec<u8> = this.buffer.drain(..end).collect();
                this.scanned = 0;
                this.handle_event(event);
                continue;
            }
            this.scanned = this.buffer.len();
            if this.buffer.len() > MAX_EVENT_BYTES {
                warn!(bytes = this.buffer.len(), "oversized SSE event forwarded unparsed");
                let raw = std::mem::take(&mut this.buffer);
                this.scanned = 0;
                this.events += 1;
                this.pending.push_back(Bytes::from(raw));
                continue;
            }

            if this.upstream_eof {
                if this.buffer.iter().any(|b| !b.is_ascii_whitespace()) {
                    // trailing event without its blank-line terminator
                    let event = std::mem::take(&mut this.buffer);
                    this.handle_event(event);
                    if this.finished {
                        continue;
                    }
                }
                this.buffer.clear();
                this.scanned = 0;
                this.complete(RelayPhase::Aborted);
                continue;
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => this.abort_with_error(err),
                Poll::Ready(None) => this.upstream_eof = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for FragmentStream {
    fn drop(&mut self) {
        if self.phase == RelayPhase::StreamingActive {
            self.phase = RelayPhase::Aborted;
            info!(
                model = %self.ctx.model,
                events = self.events,
                "client went away mid-stream; cancelling upstream"
            );
        }
    }
}

/// End offset (delimiter included) of the first complete SSE event, searching
/// from `from`. The search backs up three bytes so a delimiter split across
/// chunks is still found.
fn find_event_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(3).min(buf.len());
    let tail = &buf[start..];
    let lf = tail.windows(2).position(|w| w == b"\n\n").map(|p| start + p + 2);
    let crlf = tail
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| start + p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Joined `data:` payload of an event, or None if it carries no data lines.
fn event_data(event: &[u8]) -> Option<Vec<u8>> {
    let mut segments: Vec<&[u8]> = Vec::new();
    for line in event.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"data:") {
            segments.push(trim_ascii(rest));
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join(&b'\n'))
    }
}

fn sse_data_event(value: &Value) -> Vec<u8> {
    let mut out = b"data: ".to_vec();
    out.extend_from_slice(value.to_string().as_bytes());
    out.extend_from_slice(b"\n\n");
    out
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(start);
    &bytes[start..end]
}
