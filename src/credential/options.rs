//! Validated credential configuration.

// self
use crate::{
	_prelude::*,
	auth::ClientIdentityConfig,
	cache::DEFAULT_SAFETY_MARGIN,
	detect::DetectionState,
	env::{Environment, ProcessEnvironment},
	probe::{IdentityProbe, imds::DEFAULT_PROBE_TIMEOUT},
	retry::RetryPolicy,
};

/// Errors raised while validating [`ManagedIdentityOptions`].
#[derive(Clone, Debug, PartialEq, Eq, ThisError)]
pub enum OptionsError {
	/// Network probes need a positive time budget.
	#[error("Probe timeout must be positive.")]
	NonPositiveProbeTimeout,
	/// The cache safety margin cannot be negative.
	#[error("Cache safety margin must not be negative.")]
	NegativeSafetyMargin,
	/// A retry policy must allow at least one attempt.
	#[error("Retry policy must allow at least one attempt.")]
	ZeroAttempts,
	/// Jitter ratio must sit in `0.0..1.0`.
	#[error("Retry jitter must be within 0.0..1.0.")]
	InvalidJitter,
	/// Backoff delays must be non-negative with the cap at or above the base.
	#[error("Retry delays must be non-negative and the cap must not be below the base delay.")]
	InvalidDelays,
	/// A configured deadline must be positive.
	#[error("Retry deadline must be positive when set.")]
	NonPositiveDeadline,
	/// Identity endpoints are plain HTTP(S) services.
	#[error("Instance metadata endpoint `{url}` must use http or https.")]
	InvalidEndpointScheme {
		/// Rejected endpoint.
		url: String,
	},
	/// A custom probe list must contain at least one probe.
	#[error("Custom probe list must not be empty.")]
	EmptyProbeList,
}

/// Which [`DetectionState`] a credential reads and writes.
#[derive(Clone, Debug, Default)]
pub enum DetectionScope {
	/// A fresh state owned by the credential.
	#[default]
	Instance,
	/// A caller-provided state shared with other credentials.
	Shared(Arc<DetectionState>),
	/// The process-wide state returned by [`DetectionState::global`].
	Global,
}
impl DetectionScope {
	/// Resolves the scope into the state it designates.
	pub fn state(&self) -> Arc<DetectionState> {
		match self {
			Self::Instance => Arc::new(DetectionState::new()),
			Self::Shared(state) => state.clone(),
			Self::Global => DetectionState::global(),
		}
	}
}

/// Credential configuration produced by [`ManagedIdentityOptionsBuilder::build`].
#[derive(Clone)]
pub struct ManagedIdentityOptions {
	/// Identity requested from the endpoint.
	pub identity: ClientIdentityConfig,
	/// Explicit instance metadata endpoint, trusted without probing.
	pub imds_endpoint: Option<Url>,
	/// Bound on each network probe.
	pub probe_timeout: Duration,
	/// Tokens expiring within this window are not served from cache.
	pub safety_margin: Duration,
	/// Retry and backoff settings for exchanges.
	pub retry: RetryPolicy,
	/// Detection state selection.
	pub detection: DetectionScope,
	/// Source of environment variables.
	pub environment: Arc<dyn Environment>,
	/// Custom probe list replacing the built-in one.
	pub probes: Option<Vec<Arc<dyn IdentityProbe>>>,
}
impl ManagedIdentityOptions {
	/// Starts a builder seeded with defaults.
	pub fn builder() -> ManagedIdentityOptionsBuilder {
		ManagedIdentityOptionsBuilder::default()
	}
}
impl Default for ManagedIdentityOptions {
	fn default() -> Self {
		let builder = ManagedIdentityOptionsBuilder::default();

		Self {
			identity: builder.identity,
			imds_endpoint: builder.imds_endpoint,
			probe_timeout: builder.probe_timeout,
			safety_margin: builder.safety_margin,
			retry: builder.retry,
			detection: builder.detection,
			environment: builder.environment,
			probes: builder.probes,
		}
	}
}
impl Debug for ManagedIdentityOptions {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ManagedIdentityOptions")
			.field("identity", &self.identity)
			.field("imds_endpoint", &self.imds_endpoint)
			.field("probe_timeout", &self.probe_timeout)
			.field("safety_margin", &self.safety_margin)
			.field("retry", &self.retry)
			.field("detection", &self.detection)
			.field("custom_probes", &self.probes.as_ref().map(Vec::len))
			.finish()
	}
}

/// Builder for [`ManagedIdentityOptions`].
pub struct ManagedIdentityOptionsBuilder {
	identity: ClientIdentityConfig,
	imds_endpoint: Option<Url>,
	probe_timeout: Duration,
	safety_margin: Duration,
	retry: RetryPolicy,
	detection: DetectionScope,
	environment: Arc<dyn Environment>,
	probes: Option<Vec<Arc<dyn IdentityProbe>>>,
}
impl ManagedIdentityOptionsBuilder {
	/// Selects the system-assigned identity or a user-assigned one.
	pub fn identity(mut self, identity: impl Into<ClientIdentityConfig>) -> Self {
		self.identity = identity.into();

		self
	}

	/// Overrides the instance metadata endpoint; detection trusts it without probing.
	pub fn imds_endpoint(mut self, endpoint: Url) -> Self {
		self.imds_endpoint = Some(endpoint);

		self
	}

	/// Bounds each network probe (defaults to one second).
	pub fn probe_timeout(mut self, timeout: Duration) -> Self {
		self.probe_timeout = timeout;

		self
	}

	/// Overrides the cache safety margin (defaults to two minutes).
	pub fn safety_margin(mut self, margin: Duration) -> Self {
		self.safety_margin = margin;

		self
	}

	/// Replaces the retry policy.
	pub fn retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;

		self
	}

	/// Chooses which detection state the credential uses.
	pub fn detection(mut self, detection: DetectionScope) -> Self {
		self.detection = detection;

		self
	}

	/// Reads environment variables from `environment` instead of the process.
	pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
		self.environment = environment;

		self
	}

	/// Replaces the built-in probes; they run in the given order.
	pub fn probes<I>(mut self, probes: I) -> Self
	where
		I: IntoIterator<Item = Arc<dyn IdentityProbe>>,
	{
		self.probes = Some(probes.into_iter().collect());

		self
	}

	/// Validates the settings.
	pub fn build(self) -> Result<ManagedIdentityOptions, OptionsError> {
		if !self.probe_timeout.is_positive() {
			return Err(OptionsError::NonPositiveProbeTimeout);
		}
		if self.safety_margin.is_negative() {
			return Err(OptionsError::NegativeSafetyMargin);
		}

		validate_retry(&self.retry)?;

		if let Some(endpoint) = self
			.imds_endpoint
			.as_ref()
			.filter(|endpoint| !matches!(endpoint.scheme(), "http" | "https"))
		{
			return Err(OptionsError::InvalidEndpointScheme { url: endpoint.to_string() });
		}
		if self.probes.as_ref().is_some_and(Vec::is_empty) {
			return Err(OptionsError::EmptyProbeList);
		}

		Ok(ManagedIdentityOptions {
			identity: self.identity,
			imds_endpoint: self.imds_endpoint,
			probe_timeout: self.probe_timeout,
			safety_margin: self.safety_margin,
			retry: self.retry,
			detection: self.detection,
			environment: self.environment,
			probes: self.probes,
		})
	}
}
impl Default for ManagedIdentityOptionsBuilder {
	fn default() -> Self {
		Self {
			identity: ClientIdentityConfig::default(),
			imds_endpoint: None,
			probe_timeout: DEFAULT_PROBE_TIMEOUT,
			safety_margin: DEFAULT_SAFETY_MARGIN,
			retry: RetryPolicy::default(),
			detection: DetectionScope::default(),
			environment: Arc::new(ProcessEnvironment),
			probes: None,
		}
	}
}
impl Debug for ManagedIdentityOptionsBuilder {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("ManagedIdentityOptionsBuilder")
			.field("identity", &self.identity)
			.field("imds_endpoint", &self.imds_endpoint)
			.field("probe_timeout", &self.probe_timeout)
			.field("safety_margin", &self.safety_margin)
			.field("retry", &self.retry)
			.finish_non_exhaustive()
	}
}

fn validate_retry(retry: &RetryPolicy) -> Result<(), OptionsError> {
	if retry.max_attempts == 0 {
		return Err(OptionsError::ZeroAttempts);
	}
	if !(0.0..1.0).contains(&retry.jitter) {
		return Err(OptionsError::InvalidJitter);
	}
	if retry.base_delay.is_negative() || retry.max_delay < retry.base_delay {
		return Err(OptionsError::InvalidDelays);
	}
	if retry.deadline.is_some_and(|deadline| !deadline.is_positive()) {
		return Err(OptionsError::NonPositiveDeadline);
	}

	Ok(())
}
