use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{bail, Context};
use clap::Parser;

use chatrelay::auth::{CredentialStore, StaticCredentialStore};
use chatrelay::config::GatewayConfig;
use chatrelay::server::config_routes;
use chatrelay::tokens::TiktokenCounter;
use chatrelay::util::{cors_config_from_env, init_tracing, AppState};

/// Forwarding gateway for Chat Completions.
#[derive(Debug, Parser)]
#[command(name = "chatrelay", version, about)]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Optional YAML/JSON gateway config; flags below override it.
    #[arg(long, env = "CHATRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Credentials file (JSON or YAML) mapping client keys to upstream keys.
    #[arg(long, env = "CHATRELAY_CREDENTIALS_FILE")]
    credentials_file: Option<PathBuf>,

    /// Inline credentials: "client=upstream;client2=env:VAR".
    #[arg(long, env = "CHATRELAY_CREDENTIALS", hide_env_values = true)]
    credentials: Option<String>,

    /// Reject /proxy requests without a `path` query parameter.
    #[arg(long, env = "CHATRELAY_PATH_REQUIRED")]
    path_required: Option<bool>,

    /// Path used when `path` is optional and omitted, and by /v1/chat/completions.
    #[arg(long, env = "CHATRELAY_DEFAULT_PATH")]
    default_path: Option<String>,

    /// Upstream URL scheme (https, or http for local upstreams).
    #[arg(long, env = "CHATRELAY_UPSTREAM_SCHEME")]
    upstream_scheme: Option<String>,

    /// Comma-separated allow-list of target hosts.
    #[arg(long, env = "CHATRELAY_ALLOWED_HOSTS", value_delimiter = ',')]
    allowed_hosts: Vec<String>,

    /// Upstream host for /v1/chat/completions.
    #[arg(long, env = "CHATRELAY_DEFAULT_TARGET_HOST")]
    default_target_host: Option<String>,

    /// Emit a usage chunk before [DONE] when the upstream stream has none.
    #[arg(long, env = "CHATRELAY_STREAM_USAGE_FALLBACK")]
    stream_usage_fallback: Option<bool>,

    /// Request `stream_options.include_usage` from upstreams.
    #[arg(long, env = "CHATRELAY_STREAM_INCLUDE_USAGE")]
    stream_include_usage: Option<bool>,

    /// Overall upstream request timeout in seconds (also bounds streams).
    #[arg(long, env = "CHATRELAY_HTTP_TIMEOUT_SECONDS")]
    http_timeout_seconds: Option<u64>,

    /// Proxy URL for all upstream traffic.
    #[arg(long, env = "CHATRELAY_PROXY_URL")]
    proxy_url: Option<String>,

    /// Maximum accepted request body size in bytes.
    #[arg(long, env = "CHATRELAY_MAX_BODY_BYTES", default_value_t = 4 * 1024 * 1024)]
    max_body_bytes: usize,
}

impl Cli {
    fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let mut cfg = match &self.config {
            Some(path) => GatewayConfig::load_from_file(path)?,
            None => GatewayConfig::default(),
        };
        if let Some(v) = self.path_required {
            cfg.route.path_required = v;
        }
        if let Some(v) = &self.default_path {
            cfg.route.default_path = v.clone();
        }
        if let Some(v) = &self.upstream_scheme {
            cfg.route.upstream_scheme = v.trim().to_ascii_lowercase();
        }
        if !self.allowed_hosts.is_empty() {
            cfg.route.allowed_hosts = self
                .allowed_hosts
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Some(v) = &self.default_target_host {
            cfg.default_target_host = Some(v.trim().to_string());
        }
        if let Some(v) = self.stream_usage_fallback {
            cfg.relay.stream_usage_fallback = v;
        }
        if let Some(v) = self.stream_include_usage {
            cfg.relay.stream_include_usage = v;
        }
        if let Some(v) = self.http_timeout_seconds {
            cfg.http.timeout_seconds = Some(v);
        }
        if let Some(v) = &self.proxy_url {
            cfg.http.proxy_url = Some(v.clone());
        }
        if !matches!(cfg.route.upstream_scheme.as_str(), "http" | "https") {
            bail!("unsupported upstream scheme: {}", cfg.route.upstream_scheme);
        }
        Ok(cfg)
    }

    fn credential_store(&self) -> anyhow::Result<StaticCredentialStore> {
        let mut store = match &self.credentials_file {
            Some(path) => StaticCredentialStore::load_from_file(path)?,
            None => StaticCredentialStore::new(),
        };
        if let Some(spec) = &self.credentials {
            let inline = StaticCredentialStore::from_spec(spec).context("CHATRELAY_CREDENTIALS")?;
            store.merge(inline);
        }
        if store.is_empty() {
            tracing::warn!("No client credentials configured; every proxied request will be rejected");
        }
        Ok(store)
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = cli.gateway_config()?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(cli.credential_store()?);
    let counter = Arc::new(TiktokenCounter::default());

    tracing::info!(
        bind = %cli.bind,
        path_required = config.route.path_required,
        scheme = %config.route.upstream_scheme,
        default_target_host = config.default_target_host.as_deref().unwrap_or("-"),
        credentials = credentials.len(),
        "Starting chatrelay"
    );

    let state = web::Data::new(AppState::new(config, credentials, counter));
    let max_body = cli.max_body_bytes;

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .app_data(web::PayloadConfig::new(max_body))
            .configure(config_routes)
    })
    .bind(&cli.bind)
    .with_context(|| format!("binding {}", cli.bind))?
    .run()
    .await?;

    tracing::info!("chatrelay stopped");
    Ok(())
}
