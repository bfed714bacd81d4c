//! Error taxonomy and the client-facing error envelope.
//!
//! Every failure in the pipeline is a [`GatewayError`]. Handlers return
//! `Result<HttpResponse, GatewayError>` and actix renders the error through
//! [`ErrorEnvelope`], so all error responses share the same shape:
//!
//! ```json
//! { "error": { "message": "...", "type": "invalid_request_error" } }
//! ```

use actix_web::{HttpResponse, ResponseError};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on upstream body text echoed back in an error message.
const MAX_UPSTREAM_MESSAGE_LEN: usize = 512;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Routing(String),
    #[error("{0}")]
    Auth(String),
    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },
    #[error("relay failed: {0}")]
    Relay(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Stable taxonomy tag carried in `error.type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequestError,
    AuthenticationError,
    UpstreamError,
    RelayError,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequestError => "invalid_request_error",
            ErrorKind::AuthenticationError => "authentication_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::RelayError => "relay_error",
            ErrorKind::InternalError => "internal_error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

/// Client-facing error. Only the `error` object is serialized; the status
/// code travels on the HTTP response line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEnvelope {
    #[serde(skip)]
    pub status_code: u16,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(status_code: u16, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status_code,
            error: ErrorBody {
                message: message.into(),
                kind,
            },
        }
    }

    /// Render as a single SSE event, used when a stream fails after it started.
    pub fn to_sse_event(&self) -> Vec<u8> {
        let json = serde_json::to_vec(self).unwrap_or_else(|_| {
            br#"{"error":{"message":"stream interrupted","type":"relay_error"}}"#.to_vec()
        });
        let mut out = Vec::with_capacity(json.len() + 8);
        out.extend_from_slice(b"data: ");
        out.extend_from_slice(&json);
        out.extend_from_slice(b"\n\n");
        out
    }
}

impl GatewayError {
    /// Build an upstream error from a non-2xx status and its raw body.
    pub fn from_upstream(status: u16, body: &[u8]) -> Self {
        GatewayError::Upstream {
            status,
            message: upstream_message(status, body),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) | GatewayError::Routing(_) => {
                ErrorKind::InvalidRequestError
            }
            GatewayError::Auth(_) => ErrorKind::AuthenticationError,
            GatewayError::Upstream { .. } => ErrorKind::UpstreamError,
            GatewayError::Relay(_) => ErrorKind::RelayError,
            GatewayError::Internal(_) => ErrorKind::InternalError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Validation(_) | GatewayError::Routing(_) => StatusCode::BAD_REQUEST,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Upstream { status, .. } => StatusCode::from_u16(*status)
                .ok()
                .filter(|s| s.is_client_error() || s.is_server_error())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::Relay(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map any pipeline error onto the client envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        let message = match self {
            GatewayError::Validation(m)
            | GatewayError::Routing(m)
            | GatewayError::Auth(m)
            | GatewayError::Relay(m) => m.clone(),
            GatewayError::Upstream { message, .. } => message.clone(),
            // internal detail stays in the logs
            GatewayError::Internal(_) => "internal server error".to_string(),
        };
        ErrorEnvelope::new(self.status().as_u16(), self.kind(), message)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Upstream {
                status: StatusCode::GATEWAY_TIMEOUT.as_u16(),
                message: "upstream request timed out".to_string(),
            }
        } else if err.is_connect() {
            GatewayError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message: "could not connect to upstream".to_string(),
            }
        } else {
            GatewayError::Upstream {
                status: StatusCode::BAD_GATEWAY.as_u16(),
                message: format!("upstream request failed: {}", err.without_url()),
            }
        }
    }
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        actix_web::http::StatusCode::from_u16(self.status().as_u16())
            .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        if let GatewayError::Internal(detail) = self {
            tracing::error!(detail = %detail, "internal gateway error");
        }
        HttpResponse::build(self.status_code()).json(self.envelope())
    }
}

/// Pull a human-readable message out of an upstream error body.
///
/// Prefers the OpenAI-style `error.message`, then a top-level `message`,
/// then `error` as a plain string, then the raw body text, then the
/// canonical reason phrase.
fn upstream_message(status: u16, body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let candidate = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| value.get("message").and_then(|m| m.as_str()))
            .or_else(|| value.get("error").and_then(|e| e.as_str()));
        if let Some(msg) = candidate {
            if !msg.trim().is_empty() {
                return msg.to_string();
            }
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if !text.is_empty() {
        return truncate_chars(text, MAX_UPSTREAM_MESSAGE_LEN);
    }

    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map(|r| r.to_string())
        .unwrap_or_else(|| format!("upstream status {status}"))
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validation_and_routing_map_to_invalid_request() {
        for err in [
            GatewayError::Validation("bad".into()),
            GatewayError::Routing("missing targetHost".into()),
        ] {
            let env = err.envelope();
            assert_eq!(env.status_code, 400);
            assert_eq!(env.error.kind, ErrorKind::InvalidRequestError);
        }
    }

    #[test]
    fn auth_maps_to_401() {
        let env = GatewayError::Auth("Invalid API key".into()).envelope();
        assert_eq!(env.status_code, 401);
        assert_eq!(env.error.kind.as_str(), "authentication_error");
        assert_eq!(env.error.message, "Invalid API key");
    }

    #[test]
    fn upstream_error_keeps_status_and_message() {
        let body = json!({
            "error": {
                "message": "The model `invalid-model-name` does not exist",
                "type": "invalid_request_error",
                "code": "model_not_found"
            }
        });
        let err = GatewayError::from_upstream(400, body.to_string().as_bytes());
        let env = err.envelope();
        assert_eq!(env.status_code, 400);
        assert_eq!(env.error.kind, ErrorKind::UpstreamError);
        assert_eq!(
            env.error.message,
            "The model `invalid-model-name` does not exist"
        );
    }

    #[test]
    fn upstream_plain_text_and_empty_bodies() {
        let err = GatewayError::from_upstream(503, b"  overloaded  ");
        assert_eq!(err.envelope().error.message, "overloaded");

        let err = GatewayError::from_upstream(404, b"");
        assert_eq!(err.envelope().error.message, "Not Found");
    }

    #[test]
    fn upstream_success_status_never_leaks_as_error_status() {
        let err = GatewayError::Upstream {
            status: 200,
            message: "missing choices".into(),
        };
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn internal_detail_is_hidden() {
        let env = GatewayError::Internal("serde blew up at line 3".into()).envelope();
        assert_eq!(env.status_code, 500);
        assert_eq!(env.error.kind, ErrorKind::InternalError);
        assert_eq!(env.error.message, "internal server error");
    }

    #[test]
    fn envelope_serializes_without_status() {
        let env = ErrorEnvelope::new(502, ErrorKind::RelayError, "connection reset");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({"error": {"message": "connection reset", "type": "relay_error"}})
        );
        let event = String::from_utf8(env.to_sse_event()).unwrap();
        assert!(event.starts_with("data: {"));
        assert!(event.ends_with("\n\n"));
    }

    #[test]
    fn long_upstream_text_is_truncated() {
        let body = "x".repeat(2000);
        let err = GatewayError::from_upstream(500, body.as_bytes());
        let msg = err.envelope().error.message;
        assert!(msg.chars().count() <= MAX_UPSTREAM_MESSAGE_LEN + 1);
    }
}
