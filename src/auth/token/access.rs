//! Access tokens handed back to callers.

// self
use crate::{_prelude::*, auth::TokenSecret};

/// Errors produced when constructing an [`AccessToken`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum AccessTokenError {
	/// The token string was empty.
	#[error("Access token cannot be empty.")]
	Empty,
}

/// Bearer token plus the absolute instant it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
	token: TokenSecret,
	expires_on: OffsetDateTime,
}
impl AccessToken {
	/// Creates a token; empty strings are rejected.
	pub fn new(
		token: impl Into<String>,
		expires_on: OffsetDateTime,
	) -> Result<Self, AccessTokenError> {
		let token = TokenSecret::new(token);

		if token.is_empty() {
			return Err(AccessTokenError::Empty);
		}

		Ok(Self { token, expires_on })
	}

	/// Redacted token value.
	pub fn token(&self) -> &TokenSecret {
		&self.token
	}

	/// Absolute expiry instant (UTC).
	pub fn expires_on(&self) -> OffsetDateTime {
		self.expires_on
	}

	/// Returns `true` once `now` reached the expiry instant.
	pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
		now >= self.expires_on
	}

	/// Returns `true` when the token expires within `window` of `now`.
	pub fn expires_within(&self, window: Duration, now: OffsetDateTime) -> bool {
		match self.expires_on.checked_sub(window) {
			Some(threshold) => now >= threshold,
			None => true,
		}
	}
}
impl Debug for AccessToken {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("AccessToken")
			.field("token", &self.token)
			.field("expires_on", &self.expires_on)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;

	#[test]
	fn empty_tokens_are_rejected() {
		assert_eq!(
			AccessToken::new("", OffsetDateTime::now_utc()),
			Err(AccessTokenError::Empty)
		);
	}

	#[test]
	fn expiry_helpers_respect_boundaries() {
		let now = OffsetDateTime::now_utc();
		let token = AccessToken::new("tok1", now + Duration::minutes(5))
			.expect("Token fixture should be valid.");

		assert!(!token.is_expired_at(now));
		assert!(token.is_expired_at(now + Duration::minutes(5)));
		assert!(!token.expires_within(Duration::minutes(2), now));
		assert!(token.expires_within(Duration::minutes(2), now + Duration::minutes(3)));
		assert!(!format!("{token:?}").contains("tok1"));
	}
}
