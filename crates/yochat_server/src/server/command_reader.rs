#![forbid(unsafe_code)]

use axum::extract::ws::Message;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yochat_domain::Command;

/// Why the command reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
	/// A command was forwarded; the reader stops after the first one.
	Command(Command),
	/// Close frame or end of stream.
	PeerClosed,
	Cancelled,
}

fn frame_kind(msg: &Message) -> &'static str {
	match msg {
		Message::Text(_) => "text",
		Message::Binary(_) => "binary",
		Message::Ping(_) => "ping",
		Message::Pong(_) => "pong",
		Message::Close(_) => "close",
	}
}

/// Read client frames until a command, a close, a read error or cancellation.
///
/// `cmd_tx` is dropped on every exit path, which the coordinator reads as "peer gone".
pub async fn run_command_reader<S>(
	mut frames: S,
	cmd_tx: mpsc::Sender<Command>,
	cancel: CancellationToken,
) -> Result<ReaderExit, axum::Error>
where
	S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
	loop {
		let next = tokio::select! {
			biased;
			_ = cancel.cancelled() => return Ok(ReaderExit::Cancelled),
			next = frames.next() => next,
		};

		match next {
			None => return Ok(ReaderExit::PeerClosed),
			Some(Err(e)) => return Err(e),
			Some(Ok(Message::Close(frame))) => {
				debug!(code = frame.as_ref().map(|f| f.code), "client sent close frame");
				return Ok(ReaderExit::PeerClosed);
			}
			Some(Ok(Message::Text(text))) => match Command::parse(text.as_str()) {
				Some(cmd) => {
					tokio::select! {
						biased;
						_ = cancel.cancelled() => return Ok(ReaderExit::Cancelled),
						_ = cmd_tx.send(cmd) => {}
					}
					debug!(command = %cmd, "client command received");
					return Ok(ReaderExit::Command(cmd));
				}
				None => debug!(len = text.as_str().len(), "ignoring unrecognized text frame"),
			},
			Some(Ok(other)) => debug!(kind = frame_kind(&other), "ignoring non-text frame"),
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use futures::stream;
	use tokio::time::timeout;

	use super::*;

	fn frames(items: Vec<Result<Message, axum::Error>>) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
		stream::iter(items).chain(stream::pending())
	}

	#[tokio::test]
	async fn bye_is_forwarded_and_reader_stops() {
		let (tx, mut rx) = mpsc::channel(2);
		let input = frames(vec![
			Ok(Message::Binary(vec![1u8, 2, 3].into())),
			Ok(Message::Text("hello".into())),
			Ok(Message::Ping(Vec::<u8>::new().into())),
			Ok(Message::Text("bye".into())),
			Ok(Message::Text("BYE".into())),
			Ok(Message::Text("after".into())),
		]);

		let exit = run_command_reader(input, tx, CancellationToken::new()).await.unwrap();
		assert_eq!(exit, ReaderExit::Command(Command::Bye));
		assert_eq!(rx.recv().await, Some(Command::Bye));
		assert_eq!(rx.recv().await, None);
	}

	#[tokio::test]
	async fn close_frame_is_a_clean_peer_close() {
		let (tx, mut rx) = mpsc::channel(2);
		let input = frames(vec![Ok(Message::Text("hi".into())), Ok(Message::Close(None))]);

		let exit = run_command_reader(input, tx, CancellationToken::new()).await.unwrap();
		assert_eq!(exit, ReaderExit::PeerClosed);
		assert_eq!(rx.recv().await, None);
	}

	#[tokio::test]
	async fn end_of_stream_is_a_clean_peer_close() {
		let (tx, mut rx) = mpsc::channel(2);
		let input = stream::iter(Vec::<Result<Message, axum::Error>>::new());

		let exit = run_command_reader(input, tx, CancellationToken::new()).await.unwrap();
		assert_eq!(exit, ReaderExit::PeerClosed);
		assert_eq!(rx.recv().await, None);
	}

	#[tokio::test]
	async fn read_error_is_surfaced() {
		let (tx, mut rx) = mpsc::channel(2);
		let input = frames(vec![Err(axum::Error::new(std::io::Error::other("connection reset")))]);

		let err = run_command_reader(input, tx, CancellationToken::new()).await.unwrap_err();
		assert!(err.to_string().contains("connection reset"));
		assert_eq!(rx.recv().await, None);
	}

	#[tokio::test]
	async fn cancellation_interrupts_a_blocked_read() {
		let (tx, _rx) = mpsc::channel(2);
		let cancel = CancellationToken::new();
		let handle = tokio::spawn(run_command_reader(
			stream::pending::<Result<Message, axum::Error>>(),
			tx,
			cancel.clone(),
		));

		tokio::time::sleep(Duration::from_millis(20)).await;
		cancel.cancel();
		let exit = timeout(Duration::from_millis(200), handle).await.unwrap().unwrap().unwrap();
		assert_eq!(exit, ReaderExit::Cancelled);
	}
}
