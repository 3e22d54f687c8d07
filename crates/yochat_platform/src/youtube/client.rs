#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use yochat_domain::{BroadcastId, ChatId, PageToken};

use super::oauth::TokenEndpointError;
use crate::{ChatApi, ChatMessage, ChatPage, CredentialSource, UpstreamError};

pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/youtube/v3/";

const VIDEOS_PATH: &str = "videos";
const LIVE_CHAT_MESSAGES_PATH: &str = "liveChat/messages";

/// YouTube Data API v3 client for live chat polling.
#[derive(Clone)]
pub struct YouTubeClient {
	http: reqwest::Client,
	base_url: Url,
	credentials: Arc<dyn CredentialSource>,
}

impl YouTubeClient {
	pub fn new(
		base_url: &str,
		request_timeout: Option<Duration>,
		credentials: Arc<dyn CredentialSource>,
	) -> anyhow::Result<Self> {
		let mut base = base_url.trim().to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base).with_context(|| format!("parse youtube api base url {base}"))?;

		let mut builder = reqwest::Client::builder().user_agent("yochat/0.x (live-chat-relay)");
		if let Some(timeout) = request_timeout {
			builder = builder.timeout(timeout);
		}
		let http = builder.build().context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			credentials,
		})
	}

	fn url(&self, path: &str) -> Result<Url, UpstreamError> {
		self.base_url
			.join(path)
			.map_err(|e| UpstreamError::BadRequest(format!("join youtube url {path}: {e}")))
	}

	async fn get_json<T: DeserializeOwned>(&self, url: Url, op: &'static str) -> Result<T, UpstreamError> {
		metrics::counter!("yochat_platform_upstream_requests_total", "op" => op).increment(1);

		let result = self.get_json_inner(url, op).await;
		if let Err(e) = &result {
			metrics::counter!("yochat_platform_upstream_errors_total", "op" => op, "kind" => e.kind()).increment(1);
		}
		result
	}

	async fn get_json_inner<T: DeserializeOwned>(&self, url: Url, op: &'static str) -> Result<T, UpstreamError> {
		let token = self
			.credentials
			.bearer()
			.await
			.map_err(|e| credential_error(&e))?;

		let resp = self
			.http
			.get(url)
			.bearer_auth(token.expose())
			.header(ACCEPT, "application/json")
			.send()
			.await
			.map_err(|e| UpstreamError::Transient(format!("youtube {op} send: {e}")))?;

		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| UpstreamError::Transient(format!("youtube {op} read body: {e}")))?;

		if !status.is_success() {
			debug!(op, %status, "youtube request failed");
			return Err(UpstreamError::from_status(status, error_detail(&body)));
		}

		serde_json::from_str(&body).map_err(|e| UpstreamError::Transient(format!("youtube {op} parse json: {e}")))
	}
}

#[async_trait::async_trait]
impl ChatApi for YouTubeClient {
	async fn resolve_chat_id(&self, broadcast: &BroadcastId) -> Result<ChatId, UpstreamError> {
		let mut url = self.url(VIDEOS_PATH)?;
		url.query_pairs_mut()
			.append_pair("part", "liveStreamingDetails")
			.append_pair("id", broadcast.as_str());

		let body: VideoListResponse = self.get_json(url, "resolve_chat_id").await?;

		let Some(video) = body.items.into_iter().next() else {
			return Err(UpstreamError::NotFound(format!(
				"no video found for broadcastId {broadcast}"
			)));
		};

		video
			.live_streaming_details
			.and_then(|d| d.active_live_chat_id)
			.and_then(|id| ChatId::new(id).ok())
			.ok_or_else(|| UpstreamError::NotFound(format!("broadcastId {broadcast} has no active live chat")))
	}

	async fn poll_chat(&self, chat: &ChatId, page_token: Option<&PageToken>) -> Result<ChatPage, UpstreamError> {
		let mut url = self.url(LIVE_CHAT_MESSAGES_PATH)?;
		{
			let mut query = url.query_pairs_mut();
			query
				.append_pair("liveChatId", chat.as_str())
				.append_pair("part", "snippet,authorDetails");
			if let Some(token) = page_token {
				query.append_pair("pageToken", token.as_str());
			}
		}

		let body: LiveChatMessageListResponse = self.get_json(url, "poll_chat").await?;

		Ok(ChatPage {
			items: body.items.into_iter().map(ChatMessage::new).collect(),
			next_page_token: body.next_page_token.and_then(|t| PageToken::new(t).ok()),
			poll_after: Duration::from_millis(body.polling_interval_millis),
		})
	}
}

/// Pull `error.message` (and the first reason) out of a Google API error body.
fn error_detail(body: &str) -> String {
	if let Ok(parsed) = serde_json::from_str::<GoogleErrorResponse>(body) {
		let reason = parsed
			.error
			.errors
			.into_iter()
			.find_map(|e| e.reason)
			.map(|r| format!(" ({r})"))
			.unwrap_or_default();
		return format!("{}{}", parsed.error.message, reason);
	}

	body.chars().take(256).collect()
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
	#[serde(default)]
	items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Video {
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatMessageListResponse {
	#[serde(default)]
	items: Vec<serde_json::Value>,
	#[serde(default)]
	next_page_token: Option<String>,
	#[serde(default)]
	polling_interval_millis: u64,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorResponse {
	error: GoogleError,
}

#[derive(Debug, Deserialize)]
struct GoogleError {
	#[serde(default)]
	message: String,
	#[serde(default)]
	errors: Vec<GoogleErrorItem>,
}

#[derive(Debug, Deserialize)]
struct GoogleErrorItem {
	#[serde(default)]
	reason: Option<String>,
}

/// A token endpoint that is down or overloaded is retryable; anything else means
/// the credential itself is unusable.
fn credential_error(e: &anyhow::Error) -> UpstreamError {
	let transient = e
		.chain()
		.find_map(|c| c.downcast_ref::<TokenEndpointError>())
		.is_some_and(TokenEndpointError::is_transient);
	let detail = format!("obtain bearer credential: {e:#}");
	if transient {
		UpstreamError::Transient(detail)
	} else {
		UpstreamError::Unauthorized(detail)
	}
}
