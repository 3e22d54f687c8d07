#![forbid(unsafe_code)]

use anyhow::anyhow;

use crate::SecretString;

/// Source of bearer credentials for upstream calls.
///
/// Implementations refresh transparently; callers ask for a token before every request.
#[async_trait::async_trait]
pub trait CredentialSource: Send + Sync + 'static {
	async fn bearer(&self) -> anyhow::Result<SecretString>;
}

/// Fixed bearer token (tokens refreshed elsewhere, or tests).
#[derive(Debug, Clone)]
pub struct StaticToken {
	token: SecretString,
}

impl StaticToken {
	pub fn new(token: SecretString) -> Self {
		Self { token }
	}
}

#[async_trait::async_trait]
impl CredentialSource for StaticToken {
	async fn bearer(&self) -> anyhow::Result<SecretString> {
		if self.token.expose().trim().is_empty() {
			return Err(anyhow!("missing static access token"));
		}
		Ok(self.token.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn static_token_rejects_blank() {
		assert!(StaticToken::new(SecretString::new("  ")).bearer().await.is_err());
		let tok = StaticToken::new(SecretString::new("abc")).bearer().await.unwrap();
		assert_eq!(tok.expose(), "abc");
	}
}
