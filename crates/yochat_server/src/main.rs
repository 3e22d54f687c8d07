#![forbid(unsafe_code)]

mod config;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use yochat_platform::youtube::{OAuthClientConfig, OAuthCredentials, YouTubeClient};
use yochat_platform::{ChatApi, CredentialSource, StaticToken};

use crate::config::YouTubeSettings;
use crate::server::health::HealthState;
use crate::server::listener::{AppState, serve};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: yochat_server [--bind host:port] [--config path] [--authorize]\n\
\n\
Options:\n\
\t--bind       Listener address (default: 0.0.0.0:12539)\n\
\t--config     Config file (default: ~/.yochat/config.toml)\n\
\t--authorize  Run the OAuth consent flow even if a cached token exists\n\
\t--help       Show this help\n\
"
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct CliArgs {
	bind: Option<SocketAddr>,
	config: Option<PathBuf>,
	authorize: bool,
}

fn parse_args() -> CliArgs {
	let mut args = CliArgs::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				let addr = v.trim().parse::<SocketAddr>().unwrap_or_else(|e| {
					eprintln!("--bind expects host:port ({e})");
					usage_and_exit();
				});
				args.bind = Some(addr);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				args.config = Some(PathBuf::from(v));
			}
			"--authorize" => args.authorize = true,
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,yochat_server=debug".to_string());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());

	match otlp_endpoint.as_deref().map(otlp_tracer) {
		Some(Ok(tracer)) => {
			base.with(tracing_opentelemetry::layer().with_tracer(tracer)).init();
			info!(endpoint = otlp_endpoint.as_deref(), "otlp tracing enabled");
		}
		Some(Err(e)) => {
			base.init();
			warn!(error = %format!("{e:#}"), "otlp tracing disabled");
		}
		None => base.init(),
	}
}

/// Installs a global OTLP tracer provider for session and upstream spans.
fn otlp_tracer(endpoint: &str) -> anyhow::Result<opentelemetry_sdk::trace::SdkTracer> {
	use opentelemetry::trace::TracerProvider as _;
	use opentelemetry_otlp::WithExportConfig;

	let exporter = opentelemetry_otlp::SpanExporter::builder()
		.with_tonic()
		.with_endpoint(endpoint)
		.build()
		.with_context(|| format!("build otlp span exporter for {endpoint}"))?;
	let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
		.with_batch_exporter(exporter)
		.build();
	let tracer = provider.tracer("yochat_server");
	opentelemetry::global::set_tracer_provider(provider);
	Ok(tracer)
}

/// Serves Prometheus metrics (chat messages relayed, upstream errors, sessions) on `bind`.
fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	let installed = bind
		.parse::<SocketAddr>()
		.with_context(|| format!("invalid metrics bind address {bind} (expected host:port)"))
		.and_then(|addr| {
			metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
				.context("start prometheus exporter")
				.map(|()| addr)
		});
	match installed {
		Ok(addr) => info!(%addr, "metrics exporter listening"),
		Err(e) => warn!(error = %format!("{e:#}"), "metrics disabled"),
	}
}

async fn build_credentials(cfg: &YouTubeSettings, force_authorize: bool) -> anyhow::Result<Arc<dyn CredentialSource>> {
	if let Some(token) = cfg.access_token.clone() {
		info!("youtube credentials: static access token");
		return Ok(Arc::new(StaticToken::new(token)));
	}

	let client = OAuthClientConfig::load(&cfg.client_secret_path)
		.with_context(|| format!("load oauth client from {}", cfg.client_secret_path.display()))?;

	if !force_authorize
		&& let Some(path) = cfg.token_cache_path.clone()
		&& let Some(creds) = OAuthCredentials::from_cache(client.clone(), path, cfg.refresh_buffer)?
	{
		info!("youtube credentials: cached oauth token");
		return Ok(Arc::new(creds));
	}

	if cfg.token_cache_path.is_none() {
		warn!("no token cache path; the authorized token will not be persisted");
	}

	let mut input = tokio::io::BufReader::new(tokio::io::stdin());
	let mut output = std::io::stdout();
	let creds = OAuthCredentials::authorize_interactive(
		client,
		cfg.token_cache_path.clone(),
		cfg.refresh_buffer,
		&mut input,
		&mut output,
	)
	.await?;
	Ok(Arc::new(creds))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(bind) = args.bind {
		server_cfg.server.bind = bind.to_string();
	}
	let bind_addr: SocketAddr = server_cfg
		.server
		.bind
		.parse()
		.with_context(|| format!("invalid bind address {}", server_cfg.server.bind))?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health = HealthState::new();

	let credentials = build_credentials(&server_cfg.youtube, args.authorize).await?;
	let api: Arc<dyn ChatApi> = Arc::new(YouTubeClient::new(
		&server_cfg.youtube.api_base_url,
		server_cfg.youtube.request_timeout,
		credentials,
	)?);
	health.mark_ready();

	let shutdown = CancellationToken::new();
	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			match tokio::signal::ctrl_c().await {
				Ok(()) => {
					info!("ctrl-c received; shutting down");
					shutdown.cancel();
				}
				Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
			}
		});
	}

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, "yochat_server: listening on /watch");

	serve(listener, AppState { api, shutdown, health }).await?;

	info!("yochat_server: stopped");
	Ok(())
}
