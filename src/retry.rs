//! Bounded exponential backoff for transient identity endpoint failures.

// std
use std::time::Duration as StdDuration;
// crates.io
use rand::Rng;
// self
use crate::{
	_prelude::*,
	classify::{self, OutcomeKind, Stage},
	error::AuthenticationError,
	obs::{self, FlowKind},
};

/// Default number of attempts, including the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::milliseconds(800);
/// Default ceiling for a single backoff delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::seconds(8);
/// Default jitter ratio applied around each delay.
pub const DEFAULT_JITTER: f64 = 0.2;
/// Default bound on a whole token request, retries included.
pub const DEFAULT_DEADLINE: Duration = Duration::seconds(30);

/// Retry and backoff settings for token exchanges.
///
/// Delays double per attempt from `base_delay` up to `max_delay`, then get a uniformly
/// random ±`jitter` adjustment. A `Retry-After` hint raises the delay to at least the
/// hinted value. `deadline` bounds the entire run; `None` disables it.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
	/// Total attempts, including the first.
	pub max_attempts: u32,
	/// Delay before the first retry.
	pub base_delay: Duration,
	/// Ceiling for the exponential delay.
	pub max_delay: Duration,
	/// Jitter ratio in `0.0..1.0`.
	pub jitter: f64,
	/// Overall bound on the operation.
	pub deadline: Option<Duration>,
}
impl RetryPolicy {
	/// Policy that never retries.
	pub fn no_retry() -> Self {
		Self { max_attempts: 1, ..Self::default() }
	}

	/// Overrides the attempt count.
	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts;

		self
	}

	/// Overrides the base and maximum delays.
	pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
		self.base_delay = base_delay;
		self.max_delay = max_delay;

		self
	}

	/// Overrides the jitter ratio.
	pub fn with_jitter(mut self, jitter: f64) -> Self {
		self.jitter = jitter;

		self
	}

	/// Overrides (or disables, with `None`) the overall deadline.
	pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
		self.deadline = deadline;

		self
	}

	/// Delay to wait after failed attempt number `attempt` (1-based).
	pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
		let exponent = attempt.saturating_sub(1);
		let multiplier = 2_i32.saturating_pow(exponent);
		let backoff = self.base_delay.saturating_mul(multiplier).min(self.max_delay);
		let jittered = if self.jitter > 0.0 {
			let factor = rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter));

			Duration::saturating_seconds_f64(backoff.as_seconds_f64() * factor)
		} else {
			backoff
		};

		match retry_after {
			Some(hint) if hint > jittered => hint,
			_ => jittered,
		}
	}

	/// Runs `op` until it succeeds, fails terminally, runs out of attempts, hits the
	/// deadline, or `cancel` fires.
	///
	/// `op` receives the 1-based attempt number. Only transient failures are retried.
	pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T>
	where
		F: FnMut(u32) -> Fut,
		Fut: Future<Output = Result<T>>,
	{
		let attempts = async {
			let mut attempt = 1;

			loop {
				let err = match op(attempt).await {
					Ok(value) => return Ok(value),
					Err(e) => e,
				};

				if attempt >= self.max_attempts
					|| classify::classify_error(Stage::Exchange, &err) != OutcomeKind::Transient
				{
					return Err(err);
				}

				let delay = self.delay_for(attempt, err.retry_after());

				obs::record_retry(FlowKind::TokenRequest, attempt, delay);
				tokio::time::sleep(std_duration(delay)).await;

				attempt += 1;
			}
		};
		let bounded = async {
			match self.deadline {
				Some(deadline) => {
					let bounded = tokio::time::timeout(std_duration(deadline), attempts).await;

					bounded.unwrap_or_else(|_| {
						Err(AuthenticationError::DeadlineExceeded { deadline }.into())
					})
				},
				None => attempts.await,
			}
		};

		tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(Error::Cancelled),
			result = bounded => result,
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: DEFAULT_MAX_ATTEMPTS,
			base_delay: DEFAULT_BASE_DELAY,
			max_delay: DEFAULT_MAX_DELAY,
			jitter: DEFAULT_JITTER,
			deadline: Some(DEFAULT_DEADLINE),
		}
	}
}

/// Converts to a std duration, clamping negative values to zero.
pub(crate) fn std_duration(duration: Duration) -> StdDuration {
	StdDuration::try_from(duration).unwrap_or(StdDuration::ZERO)
}
