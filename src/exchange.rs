//! Token exchange against a detected identity endpoint.
//!
//! This module bridges a caller-supplied [`TokenHttpClient`] into the object-safe
//! [`IdentityTransport`] probes work with, performs one request/response round trip
//! (including an optional challenge answer), and normalizes the token payload into an
//! [`AccessToken`] with an absolute expiry.

// crates.io
use oauth2::{AsyncHttpClient, HttpClientError, HttpRequest};
use time::{format_description::well_known::Rfc3339, macros::format_description};
// self
use crate::{
	_prelude::*,
	auth::{AccessToken, AccessTokenError, ClientIdentityConfig},
	classify,
	error::{AuthenticationError, TransportError},
	http::{IdentityTransport, ResponseMetadata, ResponseMetadataSlot, SendFuture, TokenHttpClient},
	probe::{EndpointBinding, IdentityProbe},
};

/// Numeric `expires_on` values below this are relative seconds rather than epoch seconds.
pub const RELATIVE_EXPIRY_THRESHOLD: i64 = 1_000_000_000;

/// Maps HTTP transport failures into [`TransportError`] values.
pub trait TransportErrorMapper<E>
where
	Self: 'static + Send + Sync,
	E: 'static + Send + Sync + StdError,
{
	/// Converts an [`HttpClientError`] emitted by the transport.
	///
	/// `metadata` carries whatever the transport stored before failing, for example the
	/// status of a response whose body could not be read.
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<E>,
	) -> TransportError;
}

/// Default mapper for reqwest-backed transports.
#[cfg(feature = "reqwest")]
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransportErrorMapper;
#[cfg(feature = "reqwest")]
impl TransportErrorMapper<ReqwestError> for ReqwestTransportErrorMapper {
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<ReqwestError>,
	) -> TransportError {
		match error {
			HttpClientError::Reqwest(inner) => TransportError::from(*inner),
			HttpClientError::Http(inner) => TransportError::request(inner),
			HttpClientError::Io(inner) => inner.into(),
			HttpClientError::Other(message) => generic_transport_error(metadata, message),
			_ => generic_transport_error(metadata, "unrecognized client failure"),
		}
	}
}

/// Builds a [`TransportError::Other`] that mentions the status seen before the failure.
pub fn generic_transport_error(
	metadata: Option<&ResponseMetadata>,
	message: impl Display,
) -> TransportError {
	let message = match metadata.and_then(|meta| meta.status) {
		Some(status) => format!("{message} (after HTTP {status})"),
		None => message.to_string(),
	};

	TransportError::Other { message }
}

/// [`IdentityTransport`] backed by a [`TokenHttpClient`] and its error mapper.
pub struct MappedTransport<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	client: Arc<C>,
	mapper: Arc<M>,
}
impl<C, M> MappedTransport<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	/// Pairs a client with its mapper.
	pub fn new(client: Arc<C>, mapper: Arc<M>) -> Self {
		Self { client, mapper }
	}

	/// Underlying HTTP client.
	pub fn client(&self) -> &Arc<C> {
		&self.client
	}
}
impl<C, M> IdentityTransport for MappedTransport<C, M>
where
	C: TokenHttpClient,
	M: TransportErrorMapper<C::TransportError>,
{
	fn send(&self, request: HttpRequest) -> SendFuture<'_> {
		Box::pin(async move {
			let slot = ResponseMetadataSlot::default();
			let handle = self.client.with_metadata(slot.clone());

			match handle.call(request).await {
				Ok(response) => Ok(response),
				Err(e) => Err(self.mapper.map_transport_error(slot.take().as_ref(), e)),
			}
		})
	}
}

/// Runs one token request through `probe`'s request builder and parses the result.
pub(crate) async fn request_token(
	transport: &dyn IdentityTransport,
	probe: &dyn IdentityProbe,
	binding: &EndpointBinding,
	resource: &str,
	identity: &ClientIdentityConfig,
) -> Result<AccessToken> {
	let request = probe.build_request(binding, resource, identity)?;
	let mut response = transport.send(request).await.map_err(AuthenticationError::from)?;

	if !response.status().is_success() {
		let challenge = probe.answer_challenge(binding, resource, identity, &response).await?;

		if let Some(retry) = challenge {
			response = transport.send(retry).await.map_err(AuthenticationError::from)?;
		}
	}

	classify::check_response(&response)?;

	Ok(parse_token_response(
		Some(response.status().as_u16()),
		response.body(),
		OffsetDateTime::now_utc(),
	)?)
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_on: Option<ExpiryValue>,
	#[serde(default)]
	expires_in: Option<ExpiryValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ExpiryValue {
	Seconds(i64),
	Text(String),
}
impl Display for ExpiryValue {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Seconds(secs) => write!(f, "{secs}"),
			Self::Text(text) => f.write_str(text),
		}
	}
}

/// Parses an identity endpoint token payload received at `now`.
///
/// `expires_on` wins over `expires_in`. Numeric `expires_on` values (JSON numbers or
/// numeric strings) below [`RELATIVE_EXPIRY_THRESHOLD`] count as seconds from `now`;
/// larger values are Unix timestamps. Non-numeric `expires_on` strings are read as RFC 3339
/// or as the App Service form `M/D/YYYY h:mm:ss AM +00:00`.
pub fn parse_token_response(
	status: Option<u16>,
	body: &[u8],
	now: OffsetDateTime,
) -> Result<AccessToken, AuthenticationError> {
	let mut deserializer = serde_json::Deserializer::from_slice(body);
	let parsed: TokenResponse = serde_path_to_error::deserialize(&mut deserializer)
		.map_err(|source| AuthenticationError::TokenResponseParse {
			source: Arc::new(source),
			status,
		})?;
	let expires_on = match (parsed.expires_on, parsed.expires_in) {
		(Some(value), _) => absolute_expiry(&value, now)?,
		(None, Some(value)) => relative_expiry(&value, now)?,
		(None, None) => return Err(AuthenticationError::MissingExpiry),
	};

	if expires_on <= now {
		return Err(AuthenticationError::ExpiredToken);
	}

	AccessToken::new(parsed.access_token, expires_on).map_err(|e| match e {
		AccessTokenError::Empty => AuthenticationError::EmptyToken,
	})
}

fn absolute_expiry(
	value: &ExpiryValue,
	now: OffsetDateTime,
) -> Result<OffsetDateTime, AuthenticationError> {
	let invalid = || AuthenticationError::InvalidExpiry { value: value.to_string() };
	let numeric = match value {
		ExpiryValue::Seconds(secs) => Some(*secs),
		ExpiryValue::Text(text) => text.trim().parse::<i64>().ok(),
	};

	if let Some(secs) = numeric {
		return if secs < RELATIVE_EXPIRY_THRESHOLD {
			now.checked_add(Duration::seconds(secs)).ok_or_else(invalid)
		} else {
			OffsetDateTime::from_unix_timestamp(secs).map_err(|_| invalid())
		};
	}

	let ExpiryValue::Text(text) = value else {
		return Err(invalid());
	};
	let text = text.trim();

	OffsetDateTime::parse(text, &Rfc3339)
		.or_else(|_| {
			OffsetDateTime::parse(
				text,
				format_description!(
					"[month padding:none]/[day padding:none]/[year] [hour repr:12 padding:none]:[minute]:[second] [period] [offset_hour sign:mandatory]:[offset_minute]"
				),
			)
		})
		.map_err(|_| invalid())
}

fn relative_expiry(
	value: &ExpiryValue,
	now: OffsetDateTime,
) -> Result<OffsetDateTime, AuthenticationError> {
	let invalid = || AuthenticationError::InvalidExpiry { value: value.to_string() };
	let secs = match value {
		ExpiryValue::Seconds(secs) => *secs,
		ExpiryValue::Text(text) => text.trim().parse::<i64>().map_err(|_| invalid())?,
	};

	now.checked_add(Duration::seconds(secs)).ok_or_else(invalid)
}
