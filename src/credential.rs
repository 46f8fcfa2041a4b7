//! Managed identity credential orchestration with caching + singleflight guards.
//!
//! [`ManagedIdentityCredential::get_token`] serves fresh tokens from the cache, otherwise
//! resolves the hosting environment once through the [`EnvironmentDetector`], builds the
//! request with the selected probe, and runs the exchange under the configured
//! [`RetryPolicy`]. A per-[`CacheKey`] singleflight guard lets concurrent callers piggy-back
//! on one in-flight exchange instead of stampeding the endpoint: callers that queued behind
//! the leader receive its outcome, failures included.

mod metrics;
pub mod options;

pub use metrics::*;
pub use options::*;

// std
use std::sync::atomic::{AtomicU64, Ordering};
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, ClientIdentityConfig, TokenRequestContext},
	cache::{CacheKey, TokenCache},
	detect::{DetectionState, EnvironmentDetector},
	error::ConfigError,
	exchange::{self, MappedTransport, TransportErrorMapper},
	http::TokenHttpClient,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	probe::{self, ManagedIdentitySource},
	retry::RetryPolicy,
};
#[cfg(feature = "reqwest")]
use crate::{exchange::ReqwestTransportErrorMapper, http::ReqwestHttpClient};

const NO_ENDPOINT: &str = "no managed identity endpoint was found in this environment";

#[cfg(feature = "reqwest")]
/// Credential specialized for the crate's default reqwest transport stack.
pub type ReqwestManagedIdentityCredential =
	ManagedIdentityCredential<ReqwestHttpClient, ReqwestTransportErrorMapper>;

/// Acquires access tokens from the managed identity endpoint of the hosting environment.
///
/// The credential owns the transport, the token cache, and a handle to the detection state
/// it shares according to [`DetectionScope`]. Clones share all of them.
pub struct ManagedIdentityCredential<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	transport: Arc<MappedTransport<C, M>>,
	detector: Arc<EnvironmentDetector>,
	cache: Arc<TokenCache>,
	identity: ClientIdentityConfig,
	retry: RetryPolicy,
	metrics: Arc<CredentialMetrics>,
	flow_guards: Arc<Mutex<HashMap<CacheKey, Arc<Flight>>>>,
}
impl<C, M> ManagedIdentityCredential<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	/// Creates a credential that reuses the caller-provided transport + mapper pair.
	pub fn with_http_client(
		options: ManagedIdentityOptions,
		http_client: impl Into<Arc<C>>,
		mapper: impl Into<Arc<M>>,
	) -> Self {
		let probes =
			options.probes.unwrap_or_else(|| probe::default_probes(options.imds_endpoint.clone()));
		let detector = EnvironmentDetector::new(
			probes,
			options.environment,
			options.probe_timeout,
			options.detection.state(),
		);

		Self {
			transport: Arc::new(MappedTransport::new(http_client.into(), mapper.into())),
			detector: Arc::new(detector),
			cache: Arc::new(TokenCache::new(options.safety_margin)),
			identity: options.identity,
			retry: options.retry,
			metrics: Default::default(),
			flow_guards: Default::default(),
		}
	}

	/// Returns a token for `context`, from cache when one is fresh enough.
	///
	/// `cancel` aborts waiting on other callers, detection, the exchange, and retry sleeps
	/// with [`Error::Cancelled`]. Failures are never cached, but callers that were already
	/// waiting on the same key when an exchange failed receive that failure instead of
	/// starting another exchange.
	pub async fn get_token(
		&self,
		context: &TokenRequestContext,
		cancel: &CancellationToken,
	) -> Result<AccessToken> {
		const KIND: FlowKind = FlowKind::TokenRequest;

		obs::record_flow_outcome(KIND, FlowOutcome::Attempt);

		if let Some(token) = self.cache.get(context, OffsetDateTime::now_utc()) {
			self.record_cache_hit();

			return Ok(token);
		}

		let span = FlowSpan::new(KIND, "get_token");
		let result = span.instrument(self.acquire(context, cancel, &span)).await;

		match &result {
			Ok(_) => {
				self.metrics.record_success();
				obs::record_flow_outcome(KIND, FlowOutcome::Success);
			},
			Err(_) => {
				self.metrics.record_failure();
				obs::record_flow_outcome(KIND, FlowOutcome::Failure);
			},
		}

		result
	}

	/// Source chosen by detection, once resolved.
	pub fn source(&self) -> Option<ManagedIdentitySource> {
		self.detector.state().source()
	}

	/// Forgets the detection outcome so the next exchange probes again.
	///
	/// With [`DetectionScope::Shared`] or [`DetectionScope::Global`] this affects every
	/// credential using the same state.
	pub fn reset_detection(&self) {
		self.detector.state().reset();
	}

	/// Drops any cached token.
	pub fn clear_cache(&self) {
		self.cache.clear();
	}

	/// Detection state this credential reads and writes.
	pub fn detection_state(&self) -> &Arc<DetectionState> {
		self.detector.state()
	}

	/// Token cache backing this credential.
	pub fn cache(&self) -> &TokenCache {
		&self.cache
	}

	/// Identity requested from the endpoint.
	pub fn identity(&self) -> &ClientIdentityConfig {
		&self.identity
	}

	/// Per-credential call counters.
	pub fn metrics(&self) -> &Arc<CredentialMetrics> {
		&self.metrics
	}

	async fn acquire(
		&self,
		context: &TokenRequestContext,
		cancel: &CancellationToken,
		span: &FlowSpan,
	) -> Result<AccessToken> {
		let resource = context.scopes().to_resource().map_err(ConfigError::from)?;
		let flight = self.flight(&CacheKey::new(context));
		let generation = flight.generation();
		let _singleflight = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(Error::Cancelled),
			guard = flight.guard.lock() => Ok(guard),
		}?;

		if let Some(token) = self.cache.get(context, OffsetDateTime::now_utc()) {
			self.metrics.record_cache_hit();
			obs::record_flow_outcome(FlowKind::TokenRequest, FlowOutcome::CacheHit);

			return Ok(token);
		}
		if let Some(outcome) = flight.outcome_since(generation) {
			return outcome;
		}

		let outcome = self.lead(context, resource.as_str(), cancel, span).await;

		// Cancellation belongs to this caller and is never handed to waiters.
		if !matches!(outcome, Err(Error::Cancelled)) {
			flight.publish(&outcome);
		}

		outcome
	}

	async fn lead(
		&self,
		context: &TokenRequestContext,
		resource: &str,
		cancel: &CancellationToken,
		span: &FlowSpan,
	) -> Result<AccessToken> {
		let detection = self.detector.resolve(&*self.transport, cancel).await?;

		span.record_source(detection.source());

		let (probe, binding) = match (detection.probe(), detection.binding()) {
			(Some(probe), Some(binding)) => (probe.as_ref(), binding),
			_ => return Err(Error::unavailable(NO_ENDPOINT)),
		};
		let transport = &*self.transport;
		let identity = &self.identity;

		self.metrics.record_exchange();

		let token = self
			.retry
			.run(cancel, move |_| {
				exchange::request_token(transport, probe, binding, resource, identity)
			})
			.await?;

		self.cache.put(context, token.clone());

		Ok(token)
	}

	fn record_cache_hit(&self) {
		self.metrics.record_cache_hit();
		self.metrics.record_success();
		obs::record_flow_outcome(FlowKind::TokenRequest, FlowOutcome::CacheHit);
	}

	fn flight(&self, key: &CacheKey) -> Arc<Flight> {
		let mut guards = self.flow_guards.lock();

		guards.entry(key.clone()).or_default().clone()
	}
}
#[cfg(feature = "reqwest")]
impl ManagedIdentityCredential<ReqwestHttpClient, ReqwestTransportErrorMapper> {
	/// Creates a credential with its own reqwest-backed transport.
	///
	/// The client refuses redirects so identity secrets never follow a `Location` header.
	pub fn new(options: ManagedIdentityOptions) -> Result<Self> {
		let client = ReqwestHttpClient::try_new()?;

		Ok(Self::with_http_client(options, client, ReqwestTransportErrorMapper))
	}
}
impl<C, M> Clone for ManagedIdentityCredential<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	fn clone(&self) -> Self {
		Self {
			transport: self.transport.clone(),
			detector: self.detector.clone(),
			cache: self.cache.clone(),
			identity: self.identity.clone(),
			retry: self.retry.clone(),
			metrics: self.metrics.clone(),
			flow_guards: self.flow_guards.clone(),
		}
	}
}
impl<C, M> Debug for ManagedIdentityCredential<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ManagedIdentityCredential")
			.field("identity", &self.identity)
			.field("source", &self.source())
			.field("retry", &self.retry)
			.field("safety_margin", &self.cache.safety_margin())
			.finish()
	}
}

/// Singleflight slot for one cache key.
///
/// The leader publishes its outcome before releasing `guard`. A caller compares `completed`
/// with the value it saw on arrival; a difference means an exchange finished while it waited.
#[derive(Default)]
struct Flight {
	guard: AsyncMutex<()>,
	completed: AtomicU64,
	outcome: Mutex<Option<Result<AccessToken>>>,
}
impl Flight {
	fn generation(&self) -> u64 {
		self.completed.load(Ordering::Acquire)
	}

	fn outcome_since(&self, generation: u64) -> Option<Result<AccessToken>> {
		if self.generation() == generation {
			return None;
		}

		self.outcome.lock().clone()
	}

	fn publish(&self, outcome: &Result<AccessToken>) {
		*self.outcome.lock() = Some(outcome.clone());

		self.completed.fetch_add(1, Ordering::Release);
	}
}
