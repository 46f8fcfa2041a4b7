//! Maps raw probe and exchange outcomes onto the credential error taxonomy.
//!
//! The classifier works on plain data ([`OutcomeContext`]) so it stays independent of any
//! HTTP client. Probes use it to tell "nothing listens here" apart from real failures; the
//! retry policy uses it to decide whether another attempt is worthwhile.

// crates.io
use oauth2::HttpResponse;
// self
use crate::{
	_prelude::*,
	error::{AuthenticationError, TransportError},
	http,
};

const BODY_PREVIEW_LIMIT: usize = 256;

/// Phase of the credential flow an outcome belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
	/// First contact while detecting the environment.
	Probe,
	/// Token request against a detected or configured endpoint.
	Exchange,
}

/// Canonical outcome categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutcomeKind {
	/// No identity endpoint exists; fall back to another credential.
	Unavailable,
	/// Temporary failure worth retrying.
	Transient,
	/// The endpoint answered and refused; retrying will not help.
	Rejected,
	/// The caller cancelled.
	Cancelled,
}

/// Facts about a failed call, gathered before classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutcomeContext {
	/// Phase the failure happened in.
	pub stage: Stage,
	/// HTTP status returned by the endpoint, when one answered.
	pub http_status: Option<u16>,
	/// The request never produced a response because of a network problem or timeout.
	pub unreachable: bool,
	/// The caller's cancellation fired.
	pub cancelled: bool,
	/// The endpoint came from explicit configuration rather than discovery.
	pub endpoint_configured: bool,
}
impl OutcomeContext {
	/// Creates an empty context for `stage`.
	pub fn new(stage: Stage) -> Self {
		Self {
			stage,
			http_status: None,
			unreachable: false,
			cancelled: false,
			endpoint_configured: false,
		}
	}

	/// Adds an HTTP status code.
	pub fn with_http_status(mut self, status: u16) -> Self {
		self.http_status = Some(status);

		self
	}

	/// Marks the endpoint as unreachable.
	pub fn with_unreachable(mut self, unreachable: bool) -> Self {
		self.unreachable = unreachable;

		self
	}

	/// Marks the call as cancelled by the caller.
	pub fn with_cancelled(mut self, cancelled: bool) -> Self {
		self.cancelled = cancelled;

		self
	}

	/// Marks the endpoint as explicitly configured.
	pub fn with_endpoint_configured(mut self, configured: bool) -> Self {
		self.endpoint_configured = configured;

		self
	}

	/// Collects the facts carried by an existing error.
	pub fn from_error(stage: Stage, error: &Error) -> Self {
		let mut ctx = Self::new(stage);

		match error {
			Error::Cancelled => ctx.cancelled = true,
			Error::CredentialUnavailable { .. } => ctx.unreachable = true,
			Error::AuthenticationFailed(AuthenticationError::Transport(transport)) =>
				ctx.unreachable = transport.is_transient(),
			_ => ctx.http_status = error.status(),
		}

		ctx
	}
}

/// Classifies an outcome.
///
/// Caller cancellation always wins. An unreachable endpoint during probing means absence
/// unless the endpoint was configured explicitly; during an exchange it is transient.
/// Throttling and server errors are transient; everything else is a rejection.
pub fn classify(ctx: &OutcomeContext) -> OutcomeKind {
	if ctx.cancelled {
		return OutcomeKind::Cancelled;
	}
	if ctx.unreachable {
		return match ctx.stage {
			Stage::Probe if !ctx.endpoint_configured => OutcomeKind::Unavailable,
			_ => OutcomeKind::Transient,
		};
	}

	match ctx.http_status {
		Some(status) if status_is_transient(status) => OutcomeKind::Transient,
		_ => OutcomeKind::Rejected,
	}
}

/// Shorthand for classifying an existing error.
pub fn classify_error(stage: Stage, error: &Error) -> OutcomeKind {
	if matches!(error, Error::CredentialUnavailable { .. }) {
		return OutcomeKind::Unavailable;
	}

	classify(&OutcomeContext::from_error(stage, error))
}

/// Throttling and server-side statuses.
pub fn status_is_transient(status: u16) -> bool {
	status == 429 || (500..600).contains(&status)
}

/// Turns a non-success response into an [`AuthenticationError::Status`].
pub(crate) fn check_response(response: &HttpResponse) -> Result<(), AuthenticationError> {
	let status = response.status();

	if status.is_success() {
		return Ok(());
	}

	Err(AuthenticationError::Status {
		status: status.as_u16(),
		message: extract_message(response.body())
			.unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown status").to_owned()),
		retry_after: http::parse_retry_after(response.headers()),
	})
}

/// Maps a transport failure seen while probing onto "absent" or a real error.
pub(crate) fn probe_transport_failure(
	error: TransportError,
	endpoint_configured: bool,
) -> Result<(), Error> {
	let error = Error::from(AuthenticationError::Transport(error));
	let ctx = OutcomeContext::from_error(Stage::Probe, &error)
		.with_endpoint_configured(endpoint_configured);

	match classify(&ctx) {
		OutcomeKind::Unavailable => Ok(()),
		_ => Err(error),
	}
}

fn extract_message(body: &[u8]) -> Option<String> {
	#[derive(Deserialize)]
	struct ErrorBody {
		error: Option<ErrorField>,
		error_description: Option<String>,
		message: Option<String>,
		#[serde(rename = "Message")]
		message_pascal: Option<String>,
	}
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum ErrorField {
		Code(String),
		Nested { message: Option<String>, code: Option<String> },
	}

	if body.is_empty() {
		return None;
	}
	if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) {
		let nested = match parsed.error {
			Some(ErrorField::Code(code)) => Some(code),
			Some(ErrorField::Nested { message, code }) => message.or(code),
			None => None,
		};

		if let Some(message) =
			parsed.error_description.or(parsed.message).or(parsed.message_pascal).or(nested)
		{
			return Some(message);
		}
	}

	let text = String::from_utf8_lossy(body);
	let text = text.trim();

	if text.is_empty() { None } else { Some(truncate_preview(text)) }
}

fn truncate_preview(body: &str) -> String {
	if body.chars().count() <= BODY_PREVIEW_LIMIT {
		return body.to_owned();
	}

	let mut buf = body.chars().take(BODY_PREVIEW_LIMIT).collect::<String>();

	buf.push('…');

	buf
}
