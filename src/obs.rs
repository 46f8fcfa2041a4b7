//! Optional observability hooks for detection and token requests.
//!
//! # Feature Flags
//!
//! - Enable `tracing` to emit spans named `managed_identity.flow` with `flow`, `stage`, and
//!   (once known) `source` fields, plus debug events for retries and detection results.
//! - Enable `metrics` to increment `managed_identity_flow_total` (labeled by `flow` and
//!   `outcome`) and `managed_identity_retry_total` (labeled by `flow`).

mod metrics;
mod tracing;

pub use metrics::*;
pub use tracing::*;

// self
use crate::{_prelude::*, probe::ManagedIdentitySource};

/// Credential operations observed by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowKind {
	/// Environment detection.
	Detection,
	/// Token acquisition through `get_token`.
	TokenRequest,
}
impl FlowKind {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowKind::Detection => "detection",
			FlowKind::TokenRequest => "token_request",
		}
	}
}
impl Display for FlowKind {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Outcome labels recorded for each operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlowOutcome {
	/// Entry to the operation.
	Attempt,
	/// Served from the token cache.
	CacheHit,
	/// Successful completion.
	Success,
	/// Failure propagated back to the caller.
	Failure,
}
impl FlowOutcome {
	/// Returns a stable label suitable for span or metric fields.
	pub const fn as_str(self) -> &'static str {
		match self {
			FlowOutcome::Attempt => "attempt",
			FlowOutcome::CacheHit => "cache_hit",
			FlowOutcome::Success => "success",
			FlowOutcome::Failure => "failure",
		}
	}
}
impl Display for FlowOutcome {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Records a scheduled retry: bumps the retry counter and logs the delay.
pub fn record_retry(kind: FlowKind, attempt: u32, delay: Duration) {
	record_retry_count(kind);
	trace_retry(kind, attempt, delay);
}

/// Records the source a detection pass settled on.
pub fn record_detection(source: ManagedIdentitySource) {
	record_flow_outcome(FlowKind::Detection, FlowOutcome::Success);
	trace_detection(source);
}
