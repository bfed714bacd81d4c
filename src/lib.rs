#![forbid(unsafe_code)]
#![doc = r#"
Chatrelay

A forwarding gateway for Chat Completions. Clients call one local endpoint; the
gateway validates the request, resolves the upstream from `targetHost`/`path`,
swaps the client's bearer for an upstream credential and relays the response,
either buffered or as a server-sent event stream.

Pipeline (each stage is usable on its own):
- `validation`: `validate(raw) -> ChatCompletionRequest`.
- `route`: `RouteResolver::resolve(query) -> RouteParameters`.
- `auth`: `CredentialTranslator::translate(bearer) -> HeaderMap`.
- `assembler`: `RequestAssembler::assemble(..) -> AssembledRequest`.
- `relay`: `RelayEngine::relay(assembled) -> RelayOutcome`.
- `error`: `GatewayError` and the `{"error": {"message", "type"}}` envelope.

`server` wires the stages into actix-web handlers (`/proxy`,
`/v1/chat/completions`, `/status`); `util` holds shared state and startup helpers.
"#]

pub mod assembler;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;
pub mod relay;
pub mod route;
pub mod server;
pub mod tokens;
pub mod util;
pub mod validation;

pub use crate::assembler::{AssembledRequest, DeliveryMode, RequestAssembler};
pub use crate::auth::{
    CredentialEntry, CredentialStore, CredentialTranslator, StaticCredentialStore,
    UpstreamCredential,
};
pub use crate::config::{GatewayConfig, HttpClientConfig, RelayConfig, RoutePolicy};
pub use crate::error::{ErrorEnvelope, ErrorKind, GatewayError};
pub use crate::relay::{BufferedResponse, FragmentStream, RelayEngine, RelayOutcome, RelayPhase};
pub use crate::route::{RouteParameters, RouteQuery, RouteResolver};
pub use crate::tokens::{TiktokenCounter, TokenCounter, WhitespaceCounter};
pub use crate::validation::{validate, validate_value};

// Re-export model namespace for convenience (downstream users can do `use chatrelay::chat`).
pub use crate::models::chat;
