#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix accepted in the `url` query parameter; the remainder is the broadcast id.
pub const WATCH_URL_PREFIX: &str = "https://youtube.com/watch?=";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! opaque_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				if id.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(Self(id))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				Self::new(s.to_string())
			}
		}
	};
}

opaque_id!(
	/// Upstream live broadcast (video) identifier, supplied by the client.
	BroadcastId
);

opaque_id!(
	/// Live chat identifier resolved from a broadcast.
	ChatId
);

opaque_id!(
	/// Pagination cursor echoed back on the next poll.
	PageToken
);

impl BroadcastId {
	/// Extract a broadcast id from the `/watch` query parameters.
	///
	/// A non-blank `broadcastId` wins; otherwise `url` must start with
	/// [`WATCH_URL_PREFIX`] and the suffix is taken verbatim.
	pub fn from_query(broadcast_id: Option<&str>, url: Option<&str>) -> Result<Self, ParseIdError> {
		if let Some(id) = broadcast_id
			&& !id.trim().is_empty()
		{
			return Self::new(id);
		}

		let Some(url) = url.filter(|u| !u.is_empty()) else {
			return Err(ParseIdError::Empty);
		};

		let id = url
			.strip_prefix(WATCH_URL_PREFIX)
			.ok_or_else(|| ParseIdError::InvalidFormat(format!("url must start with {WATCH_URL_PREFIX}")))?;
		Self::new(id)
	}
}

/// Client → server control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
	/// Tear the session down.
	Bye,
}

impl Command {
	pub const fn as_str(self) -> &'static str {
		match self {
			Command::Bye => "BYE",
		}
	}

	/// Parse a text frame payload. Only exact matches are recognized.
	pub fn parse(text: &str) -> Option<Self> {
		match text {
			"BYE" => Some(Command::Bye),
			_ => None,
		}
	}
}

impl fmt::Display for Command {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
