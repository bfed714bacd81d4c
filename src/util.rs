use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use crate::assembler::RequestAssembler;
use crate::auth::{CredentialStore, CredentialTranslator};
use crate::config::{parse_flag, GatewayConfig, HttpClientConfig};
use crate::relay::RelayEngine;
use crate::route::RouteResolver;
use crate::tokens::TokenCounter;

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to the default `.env` discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    // Initialize tracing (respects RUST_LOG potentially provided by the env file)
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,actix_web=info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Build the shared upstream HTTP client. Its internal pool is the only
/// shared connection resource; connections are leased per call.
pub fn build_http_client(cfg: &HttpClientConfig) -> reqwest::Client {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(cfg.connect_timeout_seconds))
        .pool_max_idle_per_host(cfg.pool_max_idle_per_host);

    // Overall timeout also bounds streams, so it stays opt-in.
    if let Some(secs) = cfg.timeout_seconds {
        builder = builder.timeout(std::time::Duration::from_secs(secs));
    }

    if cfg.no_proxy {
        builder = builder.no_proxy();
    } else if let Some(url) = cfg.proxy_url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        match reqwest::Proxy::all(url) {
            Ok(p) => builder = builder.proxy(p),
            Err(e) => tracing::warn!(error = %e, "ignoring invalid proxy URL"),
        }
    }

    // User-Agent for observability
    builder = builder.user_agent(format!("chatrelay/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to default HTTP client");
        reqwest::Client::new()
    })
}

/// Shared application state used by the HTTP server and handlers.
///
/// Built once at startup and dropped at shutdown. Everything in here is
/// read-only or internally synchronized (the reqwest pool).
pub struct AppState {
    pub config: GatewayConfig,
    pub resolver: RouteResolver,
    pub translator: CredentialTranslator,
    pub assembler: RequestAssembler,
    pub relay: RelayEngine,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialStore>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        let http = build_http_client(&config.http);
        Self::with_http_client(config, credentials, counter, http)
    }

    pub fn with_http_client(
        config: GatewayConfig,
        credentials: Arc<dyn CredentialStore>,
        counter: Arc<dyn TokenCounter>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            resolver: RouteResolver::new(config.route.clone()),
            translator: CredentialTranslator::new(credentials),
            assembler: RequestAssembler::new(counter.clone(), config.relay.clone()),
            relay: RelayEngine::new(http, counter, config.relay.clone()),
            config,
        }
    }
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins (e.g., "https://a.com, https://b.com")
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods (e.g., "GET,POST,OPTIONS")
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds (usize)
///
/// Defaults are permissive when not configured.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match std::env::var("CORS_ALLOWED_ORIGINS") {
        Ok(origins) if origins.trim() != "*" => {
            for p in split_list(&origins) {
                cors = cors.allowed_origin(p);
            }
        }
        _ => cors = cors.allow_any_origin(),
    }

    match std::env::var("CORS_ALLOWED_METHODS") {
        Ok(methods) if methods.trim() != "*" => {
            let methods: Vec<&str> = split_list(&methods).collect();
            if !methods.is_empty() {
                cors = cors.allowed_methods(methods);
            }
        }
        _ => cors = cors.allow_any_method(),
    }

    match std::env::var("CORS_ALLOWED_HEADERS") {
        Ok(headers) if headers.trim() != "*" => {
            for h in split_list(&headers) {
                cors = cors.allowed_header(h);
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if std::env::var("CORS_ALLOW_CREDENTIALS")
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
    {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty())
}
