#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use yochat_domain::{BroadcastId, Command};
use yochat_platform::{ChatApi, ChatMessage, UpstreamError};

use super::command_reader::{ReaderExit, run_command_reader};
use super::poller::run_poller;

/// Capacity of the per-session command and message queues.
pub const QUEUE_CAPACITY: usize = 2;

/// Close code for every non-panic teardown.
///
/// 1006 is reserved for local use and must not appear in a close frame, so the
/// application range carries it instead.
pub const ABNORMAL_CLOSURE: u16 = 4006;

/// Close code when a session worker panicked.
pub const INTERNAL_ERROR: u16 = close_code::ERROR;

/// Close frame payload limit (125 bytes minus the status code).
const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Upper bound on writing the close frame to a client that stopped reading.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Resolving,
	Streaming,
	Draining,
	Closed,
}

/// First observed reason a streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
	Bye,
	PeerGone,
	UpstreamEnded,
	Cancelled,
}

impl EndCause {
	pub const fn as_str(self) -> &'static str {
		match self {
			EndCause::Bye => "bye",
			EndCause::PeerGone => "peer_gone",
			EndCause::UpstreamEnded => "upstream_ended",
			EndCause::Cancelled => "cancelled",
		}
	}
}

impl fmt::Display for EndCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Everything a session needs besides the socket.
#[derive(Clone)]
pub struct SessionContext {
	pub session_id: String,
	pub remote: SocketAddr,
	pub broadcast_id: BroadcastId,
	pub api: Arc<dyn ChatApi>,
	/// Parent of the session's cancellation; cancelled on server shutdown.
	pub shutdown: CancellationToken,
}

#[derive(Debug)]
struct Session {
	state: SessionState,
	cause: Option<EndCause>,
}

impl Session {
	fn new() -> Self {
		Self {
			state: SessionState::Resolving,
			cause: None,
		}
	}

	fn transition(&mut self, next: SessionState) {
		debug!(from = ?self.state, to = ?next, "session state");
		self.state = next;
	}

	/// Keep the first cause; later ones are ignored.
	fn record_cause(&mut self, cause: EndCause) -> EndCause {
		*self.cause.get_or_insert(cause)
	}
}

struct ActiveSessionGuard;

impl ActiveSessionGuard {
	fn new() -> Self {
		metrics::counter!("yochat_server_sessions_total").increment(1);
		metrics::gauge!("yochat_server_active_sessions").increment(1.0);
		Self
	}
}

impl Drop for ActiveSessionGuard {
	fn drop(&mut self) {
		metrics::gauge!("yochat_server_active_sessions").decrement(1.0);
	}
}

fn resolve_failure_reason(broadcast_id: &BroadcastId) -> String {
	truncate_reason(format!("Could not resolve chatId for broadcastId {broadcast_id}"))
}

fn truncate_reason(mut reason: String) -> String {
	if reason.len() > MAX_CLOSE_REASON_BYTES {
		let mut end = MAX_CLOSE_REASON_BYTES;
		while !reason.is_char_boundary(end) {
			end -= 1;
		}
		reason.truncate(end);
	}
	reason
}

async fn send_close<Si>(sink: &mut Si, code: u16, reason: String)
where
	Si: Sink<Message> + Unpin,
	Si::Error: fmt::Display,
{
	let frame = Message::Close(Some(CloseFrame {
		code,
		reason: reason.into(),
	}));
	match tokio::time::timeout(CLOSE_WRITE_TIMEOUT, sink.send(frame)).await {
		Ok(Ok(())) => debug!(code, "close frame sent"),
		Ok(Err(e)) => debug!(code, error = %e, "close frame not delivered"),
		Err(_) => debug!(code, "close frame write timed out"),
	}
}

/// Write one message; returns `false` when cancelled mid-write.
async fn forward<Si>(sink: &mut Si, msg: &ChatMessage, cancel: &CancellationToken) -> bool
where
	Si: Sink<Message> + Unpin,
	Si::Error: fmt::Display,
{
	let json = match msg.to_canonical_json() {
		Ok(json) => json,
		Err(e) => {
			metrics::counter!("yochat_server_serialization_failures_total").increment(1);
			warn!(error = %e, message_id = ?msg.id(), "failed to serialize chat message; skipping");
			return true;
		}
	};

	tokio::select! {
		biased;
		_ = cancel.cancelled() => false,
		res = sink.send(Message::Text(json.into())) => {
			match res {
				Ok(()) => metrics::counter!("yochat_server_messages_forwarded_total").increment(1),
				Err(e) => debug!(error = %e, "socket write failed; dropping message"),
			}
			true
		}
	}
}

/// Multiplex commands and chat messages onto the socket until the session ends.
///
/// Cancellation is checked first on every turn, so nothing is written after a `BYE` or
/// after the peer goes away. Returns the first cause observed; `cancel` is always
/// cancelled on return.
pub(crate) async fn multiplex<Si>(
	sink: &mut Si,
	mut cmd_rx: mpsc::Receiver<Command>,
	mut msg_rx: mpsc::Receiver<ChatMessage>,
	cancel: &CancellationToken,
) -> EndCause
where
	Si: Sink<Message> + Unpin,
	Si::Error: fmt::Display,
{
	let mut cause: Option<EndCause> = None;

	loop {
		tokio::select! {
			biased;
			_ = cancel.cancelled() => return cause.unwrap_or(EndCause::Cancelled),
			cmd = cmd_rx.recv() => {
				let next = match cmd {
					Some(Command::Bye) => EndCause::Bye,
					None => EndCause::PeerGone,
				};
				cause.get_or_insert(next);
				cancel.cancel();
			}
			msg = msg_rx.recv() => match msg {
				Some(msg) => {
					if !forward(sink, &msg, cancel).await {
						return cause.unwrap_or(EndCause::Cancelled);
					}
				}
				None => {
					cancel.cancel();
					return *cause.get_or_insert(EndCause::UpstreamEnded);
				}
			},
		}
	}
}

fn log_reader_exit(session_id: &str, res: Result<Result<ReaderExit, axum::Error>, JoinError>) -> bool {
	match res {
		Ok(Ok(ReaderExit::Command(cmd))) => {
			info!(%session_id, command = %cmd, "client requested shutdown");
			false
		}
		Ok(Ok(exit)) => {
			debug!(%session_id, exit = ?exit, "command reader finished");
			false
		}
		Ok(Err(e)) => {
			info!(%session_id, error = %e, "client read failed");
			false
		}
		Err(e) => {
			error!(%session_id, error = %e, "command reader task failed");
			true
		}
	}
}

fn log_poller_exit(session_id: &str, res: Result<Result<(), UpstreamError>, JoinError>) -> bool {
	match res {
		Ok(Ok(())) => {
			debug!(%session_id, "poller finished");
			false
		}
		Ok(Err(e)) => {
			metrics::counter!("yochat_server_poller_errors_total", "kind" => e.kind()).increment(1);
			if e.is_fatal() {
				warn!(%session_id, error = %e, kind = e.kind(), "live chat poll failed (fatal)");
			} else {
				info!(%session_id, error = %e, kind = e.kind(), "live chat poll failed");
			}
			false
		}
		Err(e) => {
			error!(%session_id, error = %e, "poller task failed");
			true
		}
	}
}

/// Drive one `/watch` session from resolve to close.
///
/// The socket gets exactly one close frame: `ABNORMAL_CLOSURE` on every ordinary exit,
/// `INTERNAL_ERROR` if a worker panicked.
pub async fn run_session(socket: WebSocket, ctx: SessionContext) {
	let _guard = ActiveSessionGuard::new();
	let SessionContext {
		session_id,
		remote,
		broadcast_id,
		api,
		shutdown,
	} = ctx;

	let mut session = Session::new();
	let (mut sink, stream) = socket.split();

	let resolved = tokio::select! {
		biased;
		_ = shutdown.cancelled() => None,
		res = api.resolve_chat_id(&broadcast_id) => Some(res),
	};
	let chat_id = match resolved {
		Some(Ok(chat_id)) => chat_id,
		Some(Err(e)) => {
			info!(%session_id, %remote, %broadcast_id, error = %e, "could not resolve live chat");
			metrics::counter!("yochat_server_session_end_total", "cause" => "resolve_failed").increment(1);
			send_close(&mut sink, ABNORMAL_CLOSURE, resolve_failure_reason(&broadcast_id)).await;
			session.transition(SessionState::Closed);
			return;
		}
		None => {
			metrics::counter!("yochat_server_session_end_total", "cause" => EndCause::Cancelled.as_str()).increment(1);
			send_close(&mut sink, ABNORMAL_CLOSURE, String::new()).await;
			session.transition(SessionState::Closed);
			return;
		}
	};

	info!(%session_id, %remote, %broadcast_id, %chat_id, "session streaming");
	session.transition(SessionState::Streaming);

	let cancel = shutdown.child_token();
	let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CAPACITY);
	let (msg_tx, msg_rx) = mpsc::channel(QUEUE_CAPACITY);

	let reader = tokio::spawn(run_command_reader(stream, cmd_tx, cancel.clone()));
	let poller = tokio::spawn(run_poller(api, chat_id, msg_tx, cancel.clone()));

	let cause = multiplex(&mut sink, cmd_rx, msg_rx, &cancel).await;
	let cause = session.record_cause(cause);
	session.transition(SessionState::Draining);
	cancel.cancel();

	let reader_panicked = log_reader_exit(&session_id, reader.await);
	let poller_panicked = log_poller_exit(&session_id, poller.await);

	let code = if reader_panicked || poller_panicked {
		INTERNAL_ERROR
	} else {
		ABNORMAL_CLOSURE
	};
	send_close(&mut sink, code, String::new()).await;
	session.transition(SessionState::Closed);

	metrics::counter!("yochat_server_session_end_total", "cause" => cause.as_str()).increment(1);
	info!(%session_id, %remote, %broadcast_id, %cause, code, "session closed");
}
