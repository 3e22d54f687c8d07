#![forbid(unsafe_code)]

mod client;
mod oauth;

pub use client::{DEFAULT_API_BASE_URL, YouTubeClient};
pub use oauth::{
	CachedToken, OAuthClientConfig, OAuthCredentials, TokenEndpointError, YOUTUBE_READONLY_SCOPE, new_oauth_state,
	parse_authorization_response,
};
