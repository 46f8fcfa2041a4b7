//! Single-slot token cache guarded by a safety margin.
//!
//! The cache remembers the most recently acquired token together with the request context
//! it was issued for. Readers clone an [`Arc`] under a short read lock; writers swap the
//! whole slot, so a lookup never observes a half-written entry.

// self
use crate::{
	_prelude::*,
	auth::{AccessToken, TenantId, TokenRequestContext},
};

/// Tokens are treated as stale this long before their actual expiry.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::minutes(2);

/// Identity of a cached token: normalized scopes plus tenant.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
	/// Fingerprint of the normalized scope set.
	pub scope_fingerprint: String,
	/// Tenant override the token was requested for.
	pub tenant: Option<TenantId>,
}
impl CacheKey {
	/// Derives the key for a request context.
	pub fn new(context: &TokenRequestContext) -> Self {
		Self {
			scope_fingerprint: context.scopes().fingerprint().to_owned(),
			tenant: context.tenant_id().cloned(),
		}
	}
}
impl From<&TokenRequestContext> for CacheKey {
	fn from(value: &TokenRequestContext) -> Self {
		Self::new(value)
	}
}

/// Token stored by [`TokenCache`] with the context it was issued for.
#[derive(Clone, Debug)]
pub struct CachedTokenEntry {
	key: CacheKey,
	context: TokenRequestContext,
	token: AccessToken,
}
impl CachedTokenEntry {
	/// Context the token was issued for.
	pub fn context(&self) -> &TokenRequestContext {
		&self.context
	}

	/// Cached token.
	pub fn token(&self) -> &AccessToken {
		&self.token
	}

	fn is_fresh_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
		!self.token.expires_within(margin, now)
	}
}

/// Thread-safe holder of the most recently acquired token.
#[derive(Debug)]
pub struct TokenCache {
	slot: RwLock<Option<Arc<CachedTokenEntry>>>,
	safety_margin: Duration,
}
impl TokenCache {
	/// Creates an empty cache that treats tokens as stale `safety_margin` before expiry.
	///
	/// Negative margins are clamped to zero.
	pub fn new(safety_margin: Duration) -> Self {
		let safety_margin = if safety_margin.is_negative() { Duration::ZERO } else { safety_margin };

		Self { slot: RwLock::new(None), safety_margin }
	}

	/// Margin applied to every lookup.
	pub fn safety_margin(&self) -> Duration {
		self.safety_margin
	}

	/// Returns the cached token when it was issued for `context` and is still fresh at `now`.
	pub fn get(&self, context: &TokenRequestContext, now: OffsetDateTime) -> Option<AccessToken> {
		let entry = self.slot.read().clone()?;

		if entry.key != CacheKey::new(context) || !entry.is_fresh_at(now, self.safety_margin) {
			return None;
		}

		Some(entry.token.clone())
	}

	/// Replaces the slot, whatever context the previous entry belonged to.
	pub fn put(&self, context: &TokenRequestContext, token: AccessToken) {
		let entry =
			CachedTokenEntry { key: CacheKey::new(context), context: context.clone(), token };

		*self.slot.write() = Some(Arc::new(entry));
	}

	/// Current entry regardless of freshness.
	pub fn peek(&self) -> Option<Arc<CachedTokenEntry>> {
		self.slot.read().clone()
	}

	/// Empties the slot.
	pub fn clear(&self) {
		self.slot.write().take();
	}
}
impl Default for TokenCache {
	fn default() -> Self {
		Self::new(DEFAULT_SAFETY_MARGIN)
	}
}
