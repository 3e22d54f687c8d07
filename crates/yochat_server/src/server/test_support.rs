#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use yochat_domain::{BroadcastId, ChatId, PageToken};
use yochat_platform::{ChatApi, ChatMessage, ChatPage, UpstreamError};

/// A chat message shaped like a `liveChatMessage` resource.
pub fn message(id: &str) -> ChatMessage {
	ChatMessage::new(json!({
		"kind": "youtube#liveChatMessage",
		"id": id,
		"snippet": { "type": "textMessageEvent", "displayMessage": format!("hello from {id}") },
		"authorDetails": { "displayName": "viewer" }
	}))
}

#[derive(Debug, Clone)]
pub struct PollCall {
	pub page_token: Option<String>,
	pub at: Instant,
}

/// Scripted `ChatApi`.
///
/// Pages are served in order. Once the script runs out the stub answers with empty pages
/// and a long interval, or with one fresh message per poll in `endless` mode.
#[derive(Default)]
pub struct StubChatApi {
	chats: HashMap<String, String>,
	script: Mutex<VecDeque<Result<ChatPage, UpstreamError>>>,
	calls: Mutex<Vec<PollCall>>,
	endless: bool,
	panic_on_poll: bool,
}

impl StubChatApi {
	pub fn new() -> Self {
		Self::default().chat("B1", "C1")
	}

	pub fn chat(mut self, broadcast: &str, chat: &str) -> Self {
		self.chats.insert(broadcast.to_string(), chat.to_string());
		self
	}

	pub fn page(self, ids: &[&str], next: Option<&str>, poll_after_ms: u64) -> Self {
		let page = ChatPage {
			items: ids.iter().map(|id| message(id)).collect(),
			next_page_token: next.map(|t| PageToken::new(t).unwrap()),
			poll_after: Duration::from_millis(poll_after_ms),
		};
		self.script.lock().unwrap().push_back(Ok(page));
		self
	}

	pub fn error(self, err: UpstreamError) -> Self {
		self.script.lock().unwrap().push_back(Err(err));
		self
	}

	pub fn endless(mut self) -> Self {
		self.endless = true;
		self
	}

	pub fn panic_on_poll(mut self) -> Self {
		self.panic_on_poll = true;
		self
	}

	pub fn poll_calls(&self) -> Vec<PollCall> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl ChatApi for StubChatApi {
	async fn resolve_chat_id(&self, broadcast: &BroadcastId) -> Result<ChatId, UpstreamError> {
		match self.chats.get(broadcast.as_str()) {
			Some(chat) => Ok(ChatId::new(chat.clone()).unwrap()),
			None => Err(UpstreamError::NotFound(format!(
				"no active live chat for broadcast {broadcast}"
			))),
		}
	}

	async fn poll_chat(&self, _chat: &ChatId, page_token: Option<&PageToken>) -> Result<ChatPage, UpstreamError> {
		if self.panic_on_poll {
			panic!("stub poll_chat panicked");
		}

		let n = {
			let mut calls = self.calls.lock().unwrap();
			calls.push(PollCall {
				page_token: page_token.map(|t| t.as_str().to_string()),
				at: Instant::now(),
			});
			calls.len()
		};

		if let Some(next) = self.script.lock().unwrap().pop_front() {
			return next;
		}

		if self.endless {
			return Ok(ChatPage {
				items: vec![message(&format!("auto-{n}"))],
				next_page_token: PageToken::new(format!("auto-{n}")).ok(),
				poll_after: Duration::ZERO,
			});
		}

		Ok(ChatPage {
			items: Vec::new(),
			next_page_token: page_token.cloned(),
			poll_after: Duration::from_secs(60),
		})
	}
}
