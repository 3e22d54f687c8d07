#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};
use yochat_platform::SecretString;
use yochat_platform::youtube::DEFAULT_API_BASE_URL;

/// Listener address when nothing else is configured.
pub const DEFAULT_BIND: &str = "0.0.0.0:12539";

/// Default config path: `~/.yochat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".yochat").join("config.toml"))
}

/// Default OAuth token cache: `<user cache dir>/yochat2ws/credential.json`.
pub fn default_token_cache_path() -> Option<PathBuf> {
	dirs::cache_dir().map(|d| d.join("yochat2ws").join("credential.json"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub youtube: YouTubeSettings,
}

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listener bind address (host:port).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
		}
	}
}

/// Upstream (YouTube Data API) settings.
#[derive(Debug, Clone)]
pub struct YouTubeSettings {
	pub api_base_url: String,
	/// Google OAuth client secret (`installed` app JSON).
	pub client_secret_path: PathBuf,
	pub token_cache_path: Option<PathBuf>,
	/// Static bearer token; bypasses the OAuth flow when set.
	pub access_token: Option<SecretString>,
	/// Overall deadline per upstream HTTP call.
	pub request_timeout: Option<Duration>,
	/// Refresh the OAuth token this long before it expires.
	pub refresh_buffer: Duration,
}

impl Default for YouTubeSettings {
	fn default() -> Self {
		Self {
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			client_secret_path: PathBuf::from("client_secret.json"),
			token_cache_path: default_token_cache_path(),
			access_token: None,
			request_timeout: None,
			refresh_buffer: Duration::from_secs(60),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	youtube: FileYouTubeSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileYouTubeSettings {
	api_base_url: Option<String>,
	client_secret_path: Option<String>,
	token_cache_path: Option<String>,
	access_token: Option<String>,
	request_timeout_secs: Option<u64>,
	refresh_buffer_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = YouTubeSettings::default();

		let youtube = YouTubeSettings {
			api_base_url: file
				.youtube
				.api_base_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.api_base_url),
			client_secret_path: file
				.youtube
				.client_secret_path
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from)
				.unwrap_or(defaults.client_secret_path),
			token_cache_path: file
				.youtube
				.token_cache_path
				.filter(|s| !s.trim().is_empty())
				.map(PathBuf::from)
				.or(defaults.token_cache_path),
			access_token: file
				.youtube
				.access_token
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			request_timeout: file
				.youtube
				.request_timeout_secs
				.filter(|v| *v > 0)
				.map(Duration::from_secs),
			refresh_buffer: file
				.youtube
				.refresh_buffer_secs
				.map(Duration::from_secs)
				.unwrap_or(defaults.refresh_buffer),
		};

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			youtube,
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	if let Some(v) = non_empty(env("YOCHAT_SERVER_BIND")) {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_METRICS_BIND")) {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_YOUTUBE_API_BASE_URL")) {
		cfg.youtube.api_base_url = v;
		info!("youtube config: api_base_url overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_YOUTUBE_CLIENT_SECRET_PATH")) {
		cfg.youtube.client_secret_path = PathBuf::from(v);
		info!("youtube config: client_secret_path overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_YOUTUBE_TOKEN_CACHE_PATH")) {
		cfg.youtube.token_cache_path = Some(PathBuf::from(v));
		info!("youtube config: token_cache_path overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_YOUTUBE_ACCESS_TOKEN")) {
		cfg.youtube.access_token = Some(SecretString::new(v));
		info!("youtube config: access_token overridden by env");
	}

	if let Some(v) = non_empty(env("YOCHAT_YOUTUBE_REQUEST_TIMEOUT_SECS")) {
		match v.parse::<u64>() {
			Ok(0) => cfg.youtube.request_timeout = None,
			Ok(secs) => {
				cfg.youtube.request_timeout = Some(Duration::from_secs(secs));
				info!(secs, "youtube config: request_timeout overridden by env");
			}
			Err(e) => warn!(error = %e, value = %v, "ignoring invalid YOCHAT_YOUTUBE_REQUEST_TIMEOUT_SECS"),
		}
	}

	if cfg.youtube.access_token.is_some() {
		info!("youtube config: static access_token set; oauth flow disabled");
	}
}
