// self
use crate::{
	_prelude::*,
	obs::FlowKind,
	probe::ManagedIdentitySource,
};

/// Type alias that resolves to an instrumented future when tracing is enabled.
#[cfg(feature = "tracing")]
pub type InstrumentedFlow<F> = tracing::instrument::Instrumented<F>;
/// Passthrough future type when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub type InstrumentedFlow<F> = F;

/// Span wrapper used around detection and token requests.
#[derive(Clone, Debug)]
pub struct FlowSpan {
	#[cfg(feature = "tracing")]
	span: tracing::Span,
}
impl FlowSpan {
	/// Creates a span tagged with the flow kind and call site.
	pub fn new(kind: FlowKind, stage: &'static str) -> Self {
		#[cfg(feature = "tracing")]
		{
			let span = tracing::info_span!(
				"managed_identity.flow",
				flow = kind.as_str(),
				stage,
				source = tracing::field::Empty
			);

			Self { span }
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = (kind, stage);

			Self {}
		}
	}

	/// Fills in the `source` field once detection resolved it.
	pub fn record_source(&self, source: ManagedIdentitySource) {
		#[cfg(feature = "tracing")]
		{
			self.span.record("source", source.as_str());
		}
		#[cfg(not(feature = "tracing"))]
		{
			let _ = source;
		}
	}

	/// Instruments an async block without holding a guard across `.await` points.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedFlow<Fut>
	where
		Fut: Future,
	{
		#[cfg(feature = "tracing")]
		{
			use tracing::Instrument;

			fut.instrument(self.span.clone())
		}
		#[cfg(not(feature = "tracing"))]
		{
			fut
		}
	}
}

pub(crate) fn trace_retry(kind: FlowKind, attempt: u32, delay: Duration) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(
			flow = kind.as_str(),
			attempt,
			delay_ms = delay.whole_milliseconds() as u64,
			"Retrying transient identity endpoint failure."
		);
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = (kind, attempt, delay);
	}
}

pub(crate) fn trace_detection(source: ManagedIdentitySource) {
	#[cfg(feature = "tracing")]
	{
		tracing::debug!(source = source.as_str(), "Managed identity source detected.");
	}
	#[cfg(not(feature = "tracing"))]
	{
		let _ = source;
	}
}
