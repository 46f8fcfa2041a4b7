//! Credential-level error types shared across probes, detection, and token exchanges.

// self
use crate::_prelude::*;

/// Crate-wide result type alias returning [`Error`] by default.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reference-counted cause carried by wrapped failures, so errors stay cloneable when one
/// outcome is handed to every caller waiting on the same exchange.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Canonical credential error exposed by public APIs.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
	/// The hosting environment does not expose a managed identity endpoint.
	///
	/// Higher layers may fall back to a different credential type; the broker never
	/// retries this outcome.
	#[error("Managed identity is unavailable: {reason}.")]
	CredentialUnavailable {
		/// Human-readable explanation of why no identity was found.
		reason: String,
	},
	/// An identity endpoint exists but the exchange with it failed.
	#[error("Managed identity authentication failed: {0}")]
	AuthenticationFailed(#[from] AuthenticationError),
	/// The caller's cancellation signal fired before the call completed.
	#[error("Token request was cancelled by the caller.")]
	Cancelled,
	/// Local configuration problem detected before contacting any endpoint.
	#[error(transparent)]
	Config(#[from] ConfigError),
}
impl Error {
	pub(crate) fn unavailable(reason: impl Into<String>) -> Self {
		Self::CredentialUnavailable { reason: reason.into() }
	}

	/// Wraps an unexpected probe failure so it surfaces as an authentication failure.
	pub fn probe(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		AuthenticationError::Probe { source: Arc::new(src) }.into()
	}

	/// Returns `true` when the retry policy may attempt the operation again.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::AuthenticationFailed(inner) => inner.is_transient(),
			_ => false,
		}
	}

	/// Retry-After hint carried by throttled responses.
	pub fn retry_after(&self) -> Option<Duration> {
		match self {
			Self::AuthenticationFailed(AuthenticationError::Status { retry_after, .. }) =>
				*retry_after,
			_ => None,
		}
	}

	/// HTTP status captured from the identity endpoint, if the failure carried one.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::AuthenticationFailed(
				AuthenticationError::Status { status, .. }
				| AuthenticationError::TokenResponseParse { status: Some(status), .. },
			) => Some(*status),
			_ => None,
		}
	}
}

/// Failures raised after an identity endpoint was reached or explicitly configured.
#[derive(Clone, Debug, ThisError)]
pub enum AuthenticationError {
	/// The endpoint answered with a non-success status.
	#[error("Identity endpoint responded with HTTP {status}: {message}.")]
	Status {
		/// HTTP status code returned by the endpoint.
		status: u16,
		/// Error message extracted from the response body.
		message: String,
		/// Retry-After hint from upstream, if supplied.
		retry_after: Option<Duration>,
	},
	/// Transport failure while talking to a detected endpoint.
	#[error(transparent)]
	Transport(#[from] TransportError),
	/// Token endpoint responded with JSON that could not be parsed.
	#[error("Identity endpoint returned a malformed token payload.")]
	TokenResponseParse {
		/// Structured parsing failure.
		#[source]
		source: Arc<serde_path_to_error::Error<serde_json::error::Error>>,
		/// HTTP status code, when available.
		status: Option<u16>,
	},
	/// Token payload carried neither `expires_on` nor `expires_in`.
	#[error("Identity endpoint response is missing an expiry.")]
	MissingExpiry,
	/// The expiry field could not be interpreted.
	#[error("Identity endpoint returned an unrecognized expiry value `{value}`.")]
	InvalidExpiry {
		/// Raw expiry value as received.
		value: String,
	},
	/// The issued token already expired when it was received.
	#[error("Identity endpoint issued a token that is already expired.")]
	ExpiredToken,
	/// The issued token string was empty.
	#[error("Identity endpoint issued an empty access token.")]
	EmptyToken,
	/// Environment detection failed unexpectedly (not a simple absence).
	#[error("Managed identity detection failed.")]
	Probe {
		/// Underlying probe failure.
		#[source]
		source: SharedError,
	},
	/// A challenge handshake could not be completed.
	#[error("Identity endpoint challenge could not be answered: {reason}.")]
	Challenge {
		/// Reason the challenge failed.
		reason: String,
	},
	/// The retry policy's overall deadline elapsed.
	#[error("Token request did not complete within {deadline}.")]
	DeadlineExceeded {
		/// Deadline that elapsed.
		deadline: Duration,
	},
}
impl AuthenticationError {
	/// Returns `true` for network failures, throttling, and server-side errors.
	pub fn is_transient(&self) -> bool {
		match self {
			Self::Status { status, .. } => crate::classify::status_is_transient(*status),
			Self::Transport(inner) => inner.is_transient(),
			_ => false,
		}
	}
}

/// Configuration and validation failures raised before any network call.
#[derive(Clone, Debug, ThisError)]
pub enum ConfigError {
	/// HTTP client could not be constructed.
	#[error("HTTP client could not be constructed.")]
	HttpClientBuild {
		/// Underlying transport builder failure.
		#[source]
		source: SharedError,
	},
	/// HTTP request construction failed.
	#[error(transparent)]
	HttpRequest(Arc<oauth2::http::Error>),
	/// An endpoint supplied by options or the environment is not a valid URL.
	#[error("Endpoint `{value}` is not a valid URL.")]
	InvalidEndpoint {
		/// Raw endpoint value.
		value: String,
		/// Underlying parsing failure.
		#[source]
		source: url::ParseError,
	},
	/// Requested scopes cannot be converted into a managed identity resource.
	#[error("Requested scopes are invalid.")]
	InvalidScope(#[from] crate::auth::ScopeValidationError),
	/// The selected source cannot serve the configured user-assigned identity.
	#[error("The {kind} managed identity source does not support user-assigned identities.")]
	UnsupportedIdentity {
		/// Source label.
		kind: &'static str,
	},
	/// Credential options failed validation.
	#[error(transparent)]
	Options(#[from] crate::credential::OptionsError),
}
impl ConfigError {
	/// Wraps a transport's builder failure inside [`ConfigError`].
	pub fn http_client_build(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::HttpClientBuild { source: Arc::new(src) }
	}

	pub(crate) fn invalid_endpoint(value: impl Into<String>, source: url::ParseError) -> Self {
		Self::InvalidEndpoint { value: value.into(), source }
	}
}
impl From<oauth2::http::Error> for ConfigError {
	fn from(e: oauth2::http::Error) -> Self {
		Self::HttpRequest(Arc::new(e))
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for ConfigError {
	fn from(e: ReqwestError) -> Self {
		Self::http_client_build(e)
	}
}

/// Transport-level failures (network, IO, request construction).
#[derive(Clone, Debug, ThisError)]
pub enum TransportError {
	/// Underlying HTTP client reported a network failure.
	#[error("Network error occurred while calling the identity endpoint.")]
	Network {
		/// Transport-specific network error.
		#[source]
		source: SharedError,
	},
	/// The request did not complete in time.
	#[error("Request to the identity endpoint timed out.")]
	Timeout,
	/// Underlying IO failure surfaced during transport.
	#[error("I/O error occurred while calling the identity endpoint.")]
	Io(#[source] Arc<std::io::Error>),
	/// The transport rejected the request before sending it.
	#[error("Identity request could not be dispatched.")]
	Request {
		/// Transport-specific construction failure.
		#[source]
		source: SharedError,
	},
	/// Any other client failure reported as text.
	#[error("HTTP client error occurred while calling the identity endpoint: {message}.")]
	Other {
		/// Client-supplied message.
		message: String,
	},
}
impl TransportError {
	/// Wraps a transport-specific network error.
	pub fn network(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Network { source: Arc::new(src) }
	}

	/// Wraps a failure that happened while preparing the request.
	pub fn request(src: impl 'static + Send + Sync + std::error::Error) -> Self {
		Self::Request { source: Arc::new(src) }
	}

	/// Request construction failures are the only non-transient transport errors.
	pub fn is_transient(&self) -> bool {
		!matches!(self, Self::Request { .. })
	}
}
impl From<std::io::Error> for TransportError {
	fn from(e: std::io::Error) -> Self {
		Self::Io(Arc::new(e))
	}
}
#[cfg(feature = "reqwest")]
impl From<ReqwestError> for TransportError {
	fn from(e: ReqwestError) -> Self {
		if e.is_builder() {
			Self::request(e)
		} else if e.is_timeout() {
			Self::Timeout
		} else {
			Self::network(e)
		}
	}
}
