use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use bytes::Bytes;
use tracing::{info, Instrument};
use uuid::Uuid;

use crate::auth::{bearer_from_header, fingerprint};
use crate::error::{GatewayError, Result};
use crate::relay::RelayOutcome;
use crate::route::{RouteParameters, RouteQuery};
use crate::util::AppState;
use crate::validation::validate;

pub const FUNCTION_CALL_HEADER: &str = "x-chatrelay-function-call";
pub const PROMPT_TOKENS_HEADER: &str = "x-chatrelay-prompt-tokens";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const ROUTES: [&str; 3] = ["/proxy", "/v1/chat/completions", "/status"];

/// Configure Actix-web routes with AppState.
pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/status", web::get().to(status))
            .route("/proxy", web::post().to(proxy))
            .route("/v1/chat/completions", web::post().to(chat_completions)),
    );
}

/// Where a request's upstream target comes from.
enum RouteSource {
    Query(String),
    DefaultHost,
}

/// `POST /proxy?targetHost=..&path=..`: forward to the caller-named upstream.
async fn proxy(state: web::Data<AppState>, req: HttpRequest, body: Bytes) -> Result<HttpResponse> {
    let source = RouteSource::Query(req.query_string().to_string());
    run_pipeline(state, req, body, source).await
}

/// `POST /v1/chat/completions`: forward to the configured default upstream.
async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse> {
    run_pipeline(state, req, body, RouteSource::DefaultHost).await
}

async fn run_pipeline(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: Bytes,
    source: RouteSource,
) -> Result<HttpResponse> {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("relay", request_id = %request_id);
    process(&state, &req, &body, source, &request_id)
        .instrument(span)
        .await
        .map(|mut resp| {
            if let Ok(v) = header::HeaderValue::from_str(&request_id) {
                resp.headers_mut()
                    .insert(header::HeaderName::from_static(REQUEST_ID_HEADER), v);
            }
            resp
        })
}

async fn process(
    state: &AppState,
    req: &HttpRequest,
    body: &[u8],
    source: RouteSource,
    request_id: &str,
) -> Result<HttpResponse> {
    let chat = validate(body)?;
    let route = resolve_route(state, &source)?;

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let credential_headers = state.translator.translate_header(auth_header)?;

    let assembled = state.assembler.assemble(&chat, &route, credential_headers)?;
    let prompt_tokens = assembled.prompt_tokens;
    info!(
        client = %bearer_from_header(auth_header).map(fingerprint).unwrap_or_default(),
        upstream = %route.url,
        model = %chat.model,
        stream = chat.is_stream(),
        request_function_call = assembled.has_function_call,
        prompt_tokens,
        "relaying chat completion"
    );

    match state.relay.relay(assembled).await? {
        RelayOutcome::Buffered(buffered) => {
            let status = actix_web::http::StatusCode::from_u16(buffered.status)
                .unwrap_or(actix_web::http::StatusCode::OK);
            Ok(HttpResponse::build(status)
                .insert_header((FUNCTION_CALL_HEADER, buffered.is_function_call().to_string()))
                .insert_header((PROMPT_TOKENS_HEADER, buffered.usage.prompt_tokens.to_string()))
                .json(buffered.body))
        }
        RelayOutcome::Streaming(stream) => {
            tracing::debug!(request_id, "streaming response to client");
            Ok(HttpResponse::Ok()
                .insert_header((header::CONTENT_TYPE, "text/event-stream"))
                .insert_header((header::CACHE_CONTROL, "no-cache"))
                .insert_header((PROMPT_TOKENS_HEADER, prompt_tokens.to_string()))
                .streaming(stream))
        }
    }
}

fn resolve_route(state: &AppState, source: &RouteSource) -> Result<RouteParameters> {
    match source {
        RouteSource::Query(qs) => {
            let query = web::Query::<RouteQuery>::from_query(qs)
                .map_err(|e| GatewayError::Routing(format!("invalid query string: {e}")))?
                .into_inner();
            state.resolver.resolve(&query)
        }
        RouteSource::DefaultHost => {
            let host = state.config.default_target_host.as_deref().ok_or_else(|| {
                GatewayError::Routing(
                    "no default upstream configured; use /proxy?targetHost=..&path=..".into(),
                )
            })?;
            let path = state.resolver.policy().default_path.clone();
            state.resolver.resolve_parts(host, Some(&path))
        }
    }
}

/// Service status endpoint exposing the active routing policy and relay flags.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let cfg = &state.config;
    web::Json(serde_json::json!({
        "name": "chatrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": ROUTES,
        "route_policy": {
            "path_required": cfg.route.path_required,
            "default_path": cfg.route.default_path,
            "upstream_scheme": cfg.route.upstream_scheme,
            "allowed_hosts": cfg.route.allowed_hosts,
        },
        "default_target_host": cfg.default_target_host,
        "credentials": state.translator.store().len(),
        "relay": {
            "stream_usage_fallback": cfg.relay.stream_usage_fallback,
            "stream_include_usage": cfg.relay.stream_include_usage,
        }
    }))
}
