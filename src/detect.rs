//! Memoized, single-flight environment detection.
//!
//! [`DetectionState`] stores the outcome of the first successful probe pass, including
//! "no identity available". Concurrent first callers share one pass; a pass that fails or
//! is cancelled leaves the state empty so the next caller probes again. Only
//! [`DetectionState::reset`] clears a stored outcome.

// std
use std::sync::{
	OnceLock,
	atomic::{AtomicU64, Ordering},
};
// crates.io
use async_lock::OnceCell;
// self
use crate::{
	_prelude::*,
	env::Environment,
	http::IdentityTransport,
	obs::{self, FlowKind, FlowOutcome, FlowSpan},
	probe::{EndpointBinding, IdentityProbe, ManagedIdentitySource, ProbeContext, ProbeOutcome},
};

/// Outcome of a detection pass.
#[derive(Clone)]
pub struct Detection {
	source: ManagedIdentitySource,
	binding: Option<EndpointBinding>,
	probe: Option<Arc<dyn IdentityProbe>>,
}
impl Detection {
	/// Detection that found `probe`'s endpoint at `binding`.
	pub fn present(probe: Arc<dyn IdentityProbe>, binding: EndpointBinding) -> Self {
		Self { source: probe.source(), binding: Some(binding), probe: Some(probe) }
	}

	/// Detection that found nothing.
	pub fn unavailable() -> Self {
		Self { source: ManagedIdentitySource::Unavailable, binding: None, probe: None }
	}

	/// Selected source.
	pub fn source(&self) -> ManagedIdentitySource {
		self.source
	}

	/// Endpoint binding, when a source was found.
	pub fn binding(&self) -> Option<&EndpointBinding> {
		self.binding.as_ref()
	}

	/// Probe that builds token requests for the selected source.
	pub fn probe(&self) -> Option<&Arc<dyn IdentityProbe>> {
		self.probe.as_ref()
	}
}
impl Debug for Detection {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("Detection")
			.field("source", &self.source)
			.field("binding", &self.binding)
			.finish()
	}
}

/// Write-once holder of a [`Detection`], shareable between credentials.
#[derive(Debug, Default)]
pub struct DetectionState {
	cell: RwLock<Arc<OnceCell<Arc<Detection>>>>,
	probe_runs: AtomicU64,
}
impl DetectionState {
	/// Creates an empty state.
	pub fn new() -> Self {
		Self::default()
	}

	/// Process-wide state for hosts that want every credential to share one detection.
	pub fn global() -> Arc<Self> {
		static GLOBAL: OnceLock<Arc<DetectionState>> = OnceLock::new();

		GLOBAL.get_or_init(|| Arc::new(Self::new())).clone()
	}

	/// Stored detection, if a pass completed since creation or the last reset.
	pub fn resolved(&self) -> Option<Arc<Detection>> {
		self.cell.read().get().cloned()
	}

	/// Selected source, if resolved.
	pub fn source(&self) -> Option<ManagedIdentitySource> {
		self.resolved().map(|detection| detection.source())
	}

	/// Forgets the stored detection; the next caller probes again.
	pub fn reset(&self) {
		*self.cell.write() = Arc::new(OnceCell::new());
	}

	/// Number of probe passes started against this state.
	pub fn probe_runs(&self) -> u64 {
		self.probe_runs.load(Ordering::Relaxed)
	}

	/// Returns the stored detection or runs `detect` to produce it, single-flight.
	pub async fn get_or_detect<F, Fut>(&self, detect: F) -> Result<Arc<Detection>>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<Detection>>,
	{
		let cell = self.cell.read().clone();
		let detection = cell
			.get_or_try_init(|| async {
				self.probe_runs.fetch_add(1, Ordering::Relaxed);

				detect().await.map(Arc::new)
			})
			.await?;

		Ok(detection.clone())
	}
}

/// Runs probes in priority order against a [`DetectionState`].
pub struct EnvironmentDetector {
	probes: Vec<Arc<dyn IdentityProbe>>,
	env: Arc<dyn Environment>,
	probe_timeout: Duration,
	state: Arc<DetectionState>,
}
impl EnvironmentDetector {
	/// Creates a detector; `probes` are evaluated in the given order.
	pub fn new(
		probes: Vec<Arc<dyn IdentityProbe>>,
		env: Arc<dyn Environment>,
		probe_timeout: Duration,
		state: Arc<DetectionState>,
	) -> Self {
		Self { probes, env, probe_timeout, state }
	}

	/// State this detector writes to.
	pub fn state(&self) -> &Arc<DetectionState> {
		&self.state
	}

	/// Returns the memoized detection, probing first if needed.
	///
	/// Cancellation while probing returns [`Error::Cancelled`] and leaves the state
	/// undetected.
	pub async fn resolve(
		&self,
		transport: &dyn IdentityTransport,
		cancel: &CancellationToken,
	) -> Result<Arc<Detection>> {
		if let Some(detection) = self.state.resolved() {
			return Ok(detection);
		}

		let span = FlowSpan::new(FlowKind::Detection, "resolve");
		let detect = self.state.get_or_detect(|| self.run_probes(transport));
		let detection = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(Error::Cancelled),
			result = span.instrument(detect) => result,
		}?;

		span.record_source(detection.source());

		Ok(detection)
	}

	async fn run_probes(&self, transport: &dyn IdentityTransport) -> Result<Detection> {
		let ctx = ProbeContext { env: &*self.env, transport, timeout: self.probe_timeout };

		obs::record_flow_outcome(FlowKind::Detection, FlowOutcome::Attempt);

		for probe in &self.probes {
			match probe.detect(ctx).await {
				Ok(ProbeOutcome::Present(binding)) => {
					let detection = Detection::present(probe.clone(), binding);

					obs::record_detection(detection.source());

					return Ok(detection);
				},
				Ok(ProbeOutcome::Absent) => continue,
				Err(e) => {
					obs::record_flow_outcome(FlowKind::Detection, FlowOutcome::Failure);

					return Err(e);
				},
			}
		}

		obs::record_detection(ManagedIdentitySource::Unavailable);

		Ok(Detection::unavailable())
	}
}
impl Debug for EnvironmentDetector {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_struct("EnvironmentDetector")
			.field("probes", &self.probes.iter().map(|probe| probe.source()).collect::<Vec<_>>())
			.field("probe_timeout", &self.probe_timeout)
			.field("state", &self.state)
			.finish()
	}
}
