#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{CredentialSource, SecretString};

pub const YOUTUBE_READONLY_SCOPE: &str = "https://www.googleapis.com/auth/youtube.readonly";

const DEFAULT_REDIRECT_URI: &str = "http://localhost";

/// Installed-app OAuth client loaded from a Google `client_secret.json`.
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
	pub client_id: String,
	pub client_secret: SecretString,
	pub auth_uri: String,
	pub token_uri: String,
	pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
	#[serde(default)]
	installed: Option<RawClient>,
	#[serde(default)]
	web: Option<RawClient>,
}

#[derive(Debug, Deserialize)]
struct RawClient {
	client_id: String,
	client_secret: String,
	auth_uri: String,
	token_uri: String,
	#[serde(default)]
	redirect_uris: Vec<String>,
}

impl OAuthClientConfig {
	pub fn from_json(s: &str) -> anyhow::Result<Self> {
		let file: ClientSecretFile = serde_json::from_str(s).context("parse client secret json")?;
		let raw = file
			.installed
			.or(file.web)
			.ok_or_else(|| anyhow!("client secret json has neither an `installed` nor a `web` section"))?;

		if raw.client_id.trim().is_empty() {
			bail!("client secret json has an empty client_id");
		}

		Ok(Self {
			client_id: raw.client_id,
			client_secret: SecretString::new(raw.client_secret),
			auth_uri: raw.auth_uri,
			token_uri: raw.token_uri,
			redirect_uris: raw.redirect_uris,
		})
	}

	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let s = fs::read_to_string(path).with_context(|| format!("read client secret {}", path.display()))?;
		Self::from_json(&s)
	}

	pub fn redirect_uri(&self) -> &str {
		self.redirect_uris
			.first()
			.map(String::as_str)
			.unwrap_or(DEFAULT_REDIRECT_URI)
	}

	/// Consent URL for the read-only YouTube scope with offline access.
	pub fn authorization_url(&self, state: &str) -> anyhow::Result<Url> {
		let mut url = Url::parse(&self.auth_uri).with_context(|| format!("parse auth_uri {}", self.auth_uri))?;
		url.query_pairs_mut()
			.append_pair("client_id", &self.client_id)
			.append_pair("redirect_uri", self.redirect_uri())
			.append_pair("response_type", "code")
			.append_pair("scope", YOUTUBE_READONLY_SCOPE)
			.append_pair("access_type", "offline")
			.append_pair("state", state);
		Ok(url)
	}
}

/// Random per-flow `state` value.
pub fn new_oauth_state() -> String {
	Uuid::new_v4().simple().to_string()
}

/// Accept either a bare authorization code or the full redirect URL.
///
/// A redirect URL must carry the expected `state`.
pub fn parse_authorization_response(input: &str, expected_state: &str) -> anyhow::Result<String> {
	let input = input.trim();
	if input.is_empty() {
		bail!("empty authorization code");
	}

	if !(input.starts_with("http://") || input.starts_with("https://")) {
		return Ok(input.to_string());
	}

	let url = Url::parse(input).context("parse redirect url")?;
	let mut code = None;
	let mut state = None;
	for (k, v) in url.query_pairs() {
		match k.as_ref() {
			"code" => code = Some(v.into_owned()),
			"state" => state = Some(v.into_owned()),
			"error" => bail!("authorization denied: {v}"),
			_ => {}
		}
	}

	if state.as_deref() != Some(expected_state) {
		bail!("oauth state mismatch");
	}
	code.filter(|c| !c.is_empty())
		.ok_or_else(|| anyhow!("redirect url has no code"))
}

/// On-disk token cache (same field names as Go's `oauth2.Token`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
	pub access_token: String,
	#[serde(default)]
	pub token_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub refresh_token: Option<String>,
	/// RFC 3339 expiry; the zero time means "never".
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expiry: Option<String>,
}

impl CachedToken {
	pub fn load(path: &Path) -> anyhow::Result<Option<Self>> {
		match fs::read_to_string(path) {
			Ok(s) => {
				let token: CachedToken = serde_json::from_str(&s).context("parse token cache")?;
				Ok(Some(token))
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(anyhow!(e).context("read token cache")),
		}
	}

	pub fn store(&self, path: &Path) -> anyhow::Result<()> {
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
		}
		let s = serde_json::to_string_pretty(self).context("serialize token cache")?;
		fs::write(path, s).with_context(|| format!("write token cache {}", path.display()))
	}

	fn expires_at(&self) -> Option<DateTime<Utc>> {
		let raw = self.expiry.as_deref()?;
		let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
		if parsed.year() <= 1 { None } else { Some(parsed) }
	}
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	token_type: Option<String>,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct TokenState {
	access_token: SecretString,
	token_type: String,
	refresh_token: Option<SecretString>,
	expires_at: Option<DateTime<Utc>>,
}

impl TokenState {
	fn from_cache(cached: CachedToken) -> Self {
		let expires_at = cached.expires_at();
		Self {
			access_token: SecretString::new(cached.access_token),
			token_type: cached.token_type,
			refresh_token: cached.refresh_token.filter(|t| !t.trim().is_empty()).map(SecretString::new),
			expires_at,
		}
	}

	/// Apply a token endpoint response; a missing refresh token keeps the old one.
	fn apply(&mut self, resp: TokenResponse) {
		self.access_token = SecretString::new(resp.access_token);
		if let Some(token_type) = resp.token_type {
			self.token_type = token_type;
		}
		if let Some(refresh) = resp.refresh_token.filter(|t| !t.trim().is_empty()) {
			self.refresh_token = Some(SecretString::new(refresh));
		}
		self.expires_at = resp
			.expires_in
			.and_then(|secs| chrono::Duration::try_seconds(secs as i64))
			.map(|d| Utc::now() + d);
	}

	fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
		if self.access_token.expose().trim().is_empty() {
			return true;
		}
		let Some(expires_at) = self.expires_at else {
			return false;
		};
		let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
		now + buffer >= expires_at
	}

	fn to_cache(&self) -> CachedToken {
		CachedToken {
			access_token: self.access_token.expose().to_string(),
			token_type: self.token_type.clone(),
			refresh_token: self.refresh_token.as_ref().map(|t| t.expose().to_string()),
			expiry: self.expires_at.map(|t| t.to_rfc3339()),
		}
	}
}

/// Refreshable OAuth2 credential backed by a token cache file.
pub struct OAuthCredentials {
	client: OAuthClientConfig,
	http: reqwest::Client,
	cache_path: Option<PathBuf>,
	refresh_buffer: Duration,
	token: Mutex<TokenState>,
}

impl OAuthCredentials {
	/// Build from the token cache; `None` when no cache exists yet.
	pub fn from_cache(
		client: OAuthClientConfig,
		cache_path: PathBuf,
		refresh_buffer: Duration,
	) -> anyhow::Result<Option<Self>> {
		let Some(cached) = CachedToken::load(&cache_path)? else {
			return Ok(None);
		};
		info!(path = %cache_path.display(), "loaded cached youtube oauth token");

		Ok(Some(Self {
			client,
			http: build_http()?,
			cache_path: Some(cache_path),
			refresh_buffer,
			token: Mutex::new(TokenState::from_cache(cached)),
		}))
	}

	/// Run the authorization-code flow: print the consent URL, read the code, exchange it.
	pub async fn authorize_interactive<R, W>(
		client: OAuthClientConfig,
		cache_path: Option<PathBuf>,
		refresh_buffer: Duration,
		input: &mut R,
		output: &mut W,
	) -> anyhow::Result<Self>
	where
		R: AsyncBufRead + Unpin,
		W: Write,
	{
		let state = new_oauth_state();
		let url = client.authorization_url(&state)?;
		writeln!(
			output,
			"Open the URL below and approve access. Then paste the code (or the full redirect URL) below:\n{url}"
		)?;
		output.flush()?;

		let mut line = String::new();
		let n = input.read_line(&mut line).await.context("read authorization code")?;
		if n == 0 {
			bail!("no authorization code received");
		}
		let code = parse_authorization_response(&line, &state)?;

		let http = build_http()?;
		let resp = request_token(
			&http,
			&client.token_uri,
			&[
				("grant_type", "authorization_code"),
				("code", code.as_str()),
				("client_id", client.client_id.as_str()),
				("client_secret", client.client_secret.expose()),
				("redirect_uri", client.redirect_uri()),
			],
		)
		.await
		.context("exchange authorization code")?;

		let mut token = TokenState {
			access_token: SecretString::new(String::new()),
			token_type: String::new(),
			refresh_token: None,
			expires_at: None,
		};
		token.apply(resp);

		let creds = Self {
			client,
			http,
			cache_path,
			refresh_buffer,
			token: Mutex::new(token.clone()),
		};
		creds.persist(&token)?;
		info!("youtube oauth authorization complete");
		Ok(creds)
	}

	fn persist(&self, token: &TokenState) -> anyhow::Result<()> {
		let Some(path) = self.cache_path.as_deref() else {
			return Ok(());
		};
		token.to_cache().store(path)
	}

	async fn refresh(&self, token: &mut TokenState) -> anyhow::Result<()> {
		let Some(refresh_token) = token.refresh_token.clone() else {
			bail!("youtube oauth token expired and no refresh_token is cached; re-run with --authorize");
		};

		let resp = request_token(
			&self.http,
			&self.client.token_uri,
			&[
				("grant_type", "refresh_token"),
				("refresh_token", refresh_token.expose()),
				("client_id", self.client.client_id.as_str()),
				("client_secret", self.client.client_secret.expose()),
			],
		)
		.await
		.context("refresh youtube oauth token")?;

		token.apply(resp);
		if let Err(e) = self.persist(token) {
			warn!(error = %e, "failed to persist refreshed oauth token");
		}
		info!("refreshed youtube oauth token");
		Ok(())
	}
}

#[async_trait::async_trait]
impl CredentialSource for OAuthCredentials {
	async fn bearer(&self) -> anyhow::Result<SecretString> {
		let mut token = self.token.lock().await;
		if token.needs_refresh(Utc::now(), self.refresh_buffer) {
			self.refresh(&mut token).await?;
		}
		Ok(token.access_token.clone())
	}
}

fn build_http() -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent("yochat/0.x (oauth)")
		.build()
		.context("build reqwest client")
}

/// Failure talking to the OAuth token endpoint.
#[derive(Debug, Error)]
pub enum TokenEndpointError {
	#[error("oauth token request: {0}")]
	Transport(String),
	#[error("oauth token request failed: status={status} body={body}")]
	Status { status: reqwest::StatusCode, body: String },
	#[error("oauth token parse json: {0}")]
	Decode(String),
}

impl TokenEndpointError {
	/// Network failures, 5xx, 429 and unreadable bodies may succeed on a later call;
	/// other statuses (e.g. `invalid_grant`) need operator action.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Transport(_) | Self::Decode(_) => true,
			Self::Status { status, .. } => {
				status.is_server_error() || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
			}
		}
	}
}

async fn request_token(
	http: &reqwest::Client,
	token_uri: &str,
	form: &[(&str, &str)],
) -> Result<TokenResponse, TokenEndpointError> {
	let resp = http
		.post(token_uri)
		.form(form)
		.send()
		.await
		.map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

	let status = resp.status();
	let body = resp
		.text()
		.await
		.map_err(|e| TokenEndpointError::Transport(e.to_string()))?;

	if !status.is_success() {
		return Err(TokenEndpointError::Status { status, body });
	}

	serde_json::from_str(&body).map_err(|e| TokenEndpointError::Decode(e.to_string()))
}
