#![forbid(unsafe_code)]

pub mod credentials;
pub mod youtube;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use yochat_domain::{BroadcastId, ChatId, PageToken};

pub use credentials::{CredentialSource, StaticToken};

/// Upstream failure taxonomy.
///
/// HTTP 400/401/403/405 are fatal for a session; everything else is transient.
/// Neither class is retried by the relay itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpstreamError {
	#[error("not found: {0}")]
	NotFound(String),
	#[error("unauthorized: {0}")]
	Unauthorized(String),
	#[error("forbidden: {0}")]
	Forbidden(String),
	#[error("bad request: {0}")]
	BadRequest(String),
	#[error("method not allowed: {0}")]
	MethodNotAllowed(String),
	#[error("transient upstream failure: {0}")]
	Transient(String),
}

impl UpstreamError {
	/// Map a non-success HTTP status to an error kind.
	pub fn from_status(status: reqwest::StatusCode, detail: impl Into<String>) -> Self {
		let detail = detail.into();
		match status {
			reqwest::StatusCode::BAD_REQUEST => Self::BadRequest(detail),
			reqwest::StatusCode::UNAUTHORIZED => Self::Unauthorized(detail),
			reqwest::StatusCode::FORBIDDEN => Self::Forbidden(detail),
			reqwest::StatusCode::METHOD_NOT_ALLOWED => Self::MethodNotAllowed(detail),
			other => Self::Transient(format!("status={other} {detail}")),
		}
	}

	/// Whether the error ends a session for reasons a reconnect won't fix.
	pub fn is_fatal(&self) -> bool {
		matches!(
			self,
			Self::Unauthorized(_) | Self::Forbidden(_) | Self::BadRequest(_) | Self::MethodNotAllowed(_)
		)
	}

	/// Stable label for logs and metrics.
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::NotFound(_) => "not_found",
			Self::Unauthorized(_) => "unauthorized",
			Self::Forbidden(_) => "forbidden",
			Self::BadRequest(_) => "bad_request",
			Self::MethodNotAllowed(_) => "method_not_allowed",
			Self::Transient(_) => "transient",
		}
	}
}

/// Opaque upstream chat message.
///
/// The relay never interprets the payload; it only re-serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatMessage(serde_json::Value);

impl ChatMessage {
	pub fn new(value: serde_json::Value) -> Self {
		Self(value)
	}

	/// Upstream message id, when present.
	pub fn id(&self) -> Option<&str> {
		self.0.get("id").and_then(|v| v.as_str())
	}

	/// Canonical JSON form written to the client (compact, object keys sorted).
	pub fn to_canonical_json(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(&self.0)
	}
}

/// One page of a live chat poll.
#[derive(Debug, Clone, Default)]
pub struct ChatPage {
	/// Messages in upstream order.
	pub items: Vec<ChatMessage>,
	pub next_page_token: Option<PageToken>,
	/// Upstream-advised minimum delay before the next poll.
	pub poll_after: Duration,
}

/// Contract over the upstream live-chat provider.
#[async_trait::async_trait]
pub trait ChatApi: Send + Sync + 'static {
	/// Resolve a broadcast to its active live chat.
	async fn resolve_chat_id(&self, broadcast: &BroadcastId) -> Result<ChatId, UpstreamError>;

	/// Fetch the next page of chat messages. `page_token` is `None` on the first call.
	async fn poll_chat(&self, chat: &ChatId, page_token: Option<&PageToken>) -> Result<ChatPage, UpstreamError>;
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Generate an opaque session id.
pub fn new_session_id() -> String {
	Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use reqwest::StatusCode;
	use serde_json::json;

	use super::*;

	#[test]
	fn status_mapping_splits_fatal_and_transient() {
		for status in [
			StatusCode::BAD_REQUEST,
			StatusCode::UNAUTHORIZED,
			StatusCode::FORBIDDEN,
			StatusCode::METHOD_NOT_ALLOWED,
		] {
			assert!(UpstreamError::from_status(status, "x").is_fatal(), "{status} should be fatal");
		}

		for status in [
			StatusCode::NOT_FOUND,
			StatusCode::TOO_MANY_REQUESTS,
			StatusCode::INTERNAL_SERVER_ERROR,
			StatusCode::SERVICE_UNAVAILABLE,
		] {
			let err = UpstreamError::from_status(status, "x");
			assert_eq!(err.kind(), "transient", "{status} should be transient");
			assert!(!err.is_fatal());
		}
	}

	#[test]
	fn canonical_json_sorts_keys() {
		let msg = ChatMessage::new(json!({"snippet": {"b": 2, "a": 1}, "id": "m1"}));
		assert_eq!(msg.id(), Some("m1"));
		assert_eq!(
			msg.to_canonical_json().unwrap(),
			r#"{"id":"m1","snippet":{"a":1,"b":2}}"#
		);
	}

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("ya29.secret");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(s.to_string(), "<redacted>");
		assert_eq!(s.expose(), "ya29.secret");
	}
}
