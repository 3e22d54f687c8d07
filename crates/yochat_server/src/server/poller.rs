#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yochat_domain::{ChatId, PageToken};
use yochat_platform::{ChatApi, ChatMessage, ChatPage, UpstreamError};

/// Pagination state for one session.
///
/// Starts with no token and no delay, so the first poll fires immediately without a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollCursor {
	pub page_token: Option<PageToken>,
	pub next_delay: Duration,
}

impl PollCursor {
	fn advance(&mut self, next_page_token: Option<PageToken>, poll_after: Duration) {
		self.page_token = next_page_token;
		self.next_delay = poll_after;
	}
}

/// Poll `chat_id` until cancelled or the upstream fails.
///
/// Messages go out in upstream order; a full channel blocks the loop. Returns `Ok` on
/// cancellation or when the receiver is gone. `out_tx` is dropped on every exit path.
pub async fn run_poller(
	api: Arc<dyn ChatApi>,
	chat_id: ChatId,
	out_tx: mpsc::Sender<ChatMessage>,
	cancel: CancellationToken,
) -> Result<(), UpstreamError> {
	let mut cursor = PollCursor::default();

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return Ok(()),
			_ = tokio::time::sleep(cursor.next_delay) => {}
		}

		let page = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Ok(()),
			res = api.poll_chat(&chat_id, cursor.page_token.as_ref()) => res?,
		};
		metrics::counter!("yochat_server_polls_total").increment(1);

		let ChatPage {
			items,
			next_page_token,
			poll_after,
		} = page;
		debug!(
			chat_id = %chat_id,
			items = items.len(),
			poll_after_ms = poll_after.as_millis() as u64,
			"polled live chat"
		);
		cursor.advance(next_page_token, poll_after);

		for msg in items {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return Ok(()),
				sent = out_tx.send(msg) => {
					if sent.is_err() {
						debug!(chat_id = %chat_id, "message receiver dropped; poller exiting");
						return Ok(());
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use tokio::time::timeout;

	use super::*;
	use crate::server::test_support::StubChatApi;

	fn spawn(
		api: Arc<StubChatApi>,
		cap: usize,
	) -> (
		tokio::task::JoinHandle<Result<(), UpstreamError>>,
		mpsc::Receiver<ChatMessage>,
		CancellationToken,
	) {
		let (tx, rx) = mpsc::channel(cap);
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run_poller(api, ChatId::new("C1").unwrap(), tx, cancel.clone()));
		(handle, rx, cancel)
	}

	async fn recv_id(rx: &mut mpsc::Receiver<ChatMessage>) -> String {
		let msg = timeout(Duration::from_secs(2), rx.recv())
			.await
			.expect("message within timeout")
			.expect("channel open");
		msg.id().expect("message id").to_string()
	}

	async fn wait_for_polls(api: &StubChatApi, n: usize) {
		let deadline = Instant::now() + Duration::from_secs(2);
		while api.poll_calls().len() < n {
			assert!(Instant::now() < deadline, "expected {n} polls");
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	}

	#[tokio::test]
	async fn forwards_pages_in_order_and_echoes_page_tokens() {
		let api = Arc::new(
			StubChatApi::new()
				.page(&["m1", "m2"], Some("p2"), 0)
				.page(&["m3"], Some("p3"), 0),
		);
		let (handle, mut rx, cancel) = spawn(Arc::clone(&api), 2);

		assert_eq!(recv_id(&mut rx).await, "m1");
		assert_eq!(recv_id(&mut rx).await, "m2");
		assert_eq!(recv_id(&mut rx).await, "m3");

		wait_for_polls(&api, 3).await;
		let tokens: Vec<_> = api.poll_calls().into_iter().map(|c| c.page_token).take(3).collect();
		assert_eq!(tokens, vec![None, Some("p2".to_string()), Some("p3".to_string())]);

		cancel.cancel();
		let res = timeout(Duration::from_millis(500), handle).await.expect("poller exits").unwrap();
		assert!(res.is_ok());
		assert!(rx.recv().await.is_none(), "channel closes when the poller exits");
	}

	#[tokio::test]
	async fn next_poll_waits_for_advertised_interval() {
		let api = Arc::new(StubChatApi::new().page(&["m1"], Some("p2"), 150).page(&[], Some("p3"), 0));
		let (handle, mut rx, cancel) = spawn(Arc::clone(&api), 2);

		assert_eq!(recv_id(&mut rx).await, "m1");
		wait_for_polls(&api, 2).await;

		let calls = api.poll_calls();
		let gap = calls[1].at.duration_since(calls[0].at);
		assert!(gap >= Duration::from_millis(150), "second poll came after {gap:?}");

		cancel.cancel();
		timeout(Duration::from_millis(500), handle).await.unwrap().unwrap().unwrap();
	}

	#[tokio::test]
	async fn fatal_error_ends_poller_and_closes_channel() {
		let api = Arc::new(
			StubChatApi::new()
				.page(&["m1"], Some("p2"), 0)
				.error(UpstreamError::Forbidden("chat disabled".to_string())),
		);
		let (handle, mut rx, _cancel) = spawn(Arc::clone(&api), 2);

		assert_eq!(recv_id(&mut rx).await, "m1");
		let err = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap_err();
		assert!(err.is_fatal());
		assert!(rx.recv().await.is_none());
	}

	#[tokio::test]
	async fn transient_error_is_not_retried() {
		let api = Arc::new(StubChatApi::new().error(UpstreamError::Transient("503".to_string())));
		let (handle, mut rx, _cancel) = spawn(Arc::clone(&api), 2);

		let err = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap().unwrap_err();
		assert!(!err.is_fatal());
		assert!(rx.recv().await.is_none());
		assert_eq!(api.poll_calls().len(), 1, "transient failures end the poller without retrying");
	}

	#[tokio::test]
	async fn slow_consumer_bounds_outstanding_messages() {
		let api = Arc::new(StubChatApi::new().endless());
		let (handle, mut rx, cancel) = spawn(Arc::clone(&api), 2);

		tokio::time::sleep(Duration::from_millis(200)).await;
		let polls = api.poll_calls().len();
		assert!(polls <= 3, "poller should block on a full queue, saw {polls} polls");

		cancel.cancel();
		let res = timeout(Duration::from_millis(200), handle).await.expect("blocked send honors cancel");
		assert!(res.unwrap().is_ok());

		let mut ids = Vec::new();
		while let Some(msg) = rx.recv().await {
			ids.push(msg.id().unwrap().to_string());
		}
		assert_eq!(ids, vec!["auto-1", "auto-2"]);
	}

	#[tokio::test]
	async fn cancel_during_interval_returns_promptly() {
		let api = Arc::new(StubChatApi::new().page(&["m1"], Some("p2"), 10_000));
		let (handle, mut rx, cancel) = spawn(Arc::clone(&api), 2);

		assert_eq!(recv_id(&mut rx).await, "m1");
		cancel.cancel();
		let res = timeout(Duration::from_millis(200), handle).await.expect("poller exits");
		assert!(res.unwrap().is_ok());
		assert_eq!(api.poll_calls().len(), 1);
	}

	#[test]
	fn cursor_starts_empty() {
		let mut cursor = PollCursor::default();
		assert!(cursor.page_token.is_none());
		assert_eq!(cursor.next_delay, Duration::ZERO);

		cursor.advance(Some(PageToken::new("p2").unwrap()), Duration::from_millis(500));
		assert_eq!(cursor.page_token.as_ref().map(PageToken::as_str), Some("p2"));
		assert_eq!(cursor.next_delay, Duration::from_millis(500));
	}
}
