// std
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters for `get_token` calls on one credential.
#[derive(Debug, Default)]
pub struct CredentialMetrics {
	cache_hits: AtomicU64,
	exchanges: AtomicU64,
	success: AtomicU64,
	failure: AtomicU64,
}
impl CredentialMetrics {
	/// Returns the number of calls served from the token cache.
	pub fn cache_hits(&self) -> u64 {
		self.cache_hits.load(Ordering::Relaxed)
	}

	/// Returns the number of token exchanges started against an endpoint (retries excluded).
	pub fn exchanges(&self) -> u64 {
		self.exchanges.load(Ordering::Relaxed)
	}

	/// Returns the number of calls that produced a token (including cache hits).
	pub fn successes(&self) -> u64 {
		self.success.load(Ordering::Relaxed)
	}

	/// Returns the number of calls that failed.
	pub fn failures(&self) -> u64 {
		self.failure.load(Ordering::Relaxed)
	}

	pub(crate) fn record_cache_hit(&self) {
		self.cache_hits.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_exchange(&self) {
		self.exchanges.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_success(&self) {
		self.success.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn record_failure(&self) {
		self.failure.fetch_add(1, Ordering::Relaxed);
	}
}
