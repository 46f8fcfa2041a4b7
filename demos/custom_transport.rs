//! Demonstrates plugging a custom HTTP client and mapper into the credential.
//!
//! 1. Implement [`TokenHttpClient`] so the transport records [`ResponseMetadata`] via the provided
//!    [`ResponseMetadataSlot`].
//! 2. Provide a [`TransportErrorMapper`] that understands both the transport error type and the
//!    captured metadata.
//! 3. Pass both to [`ManagedIdentityCredential::with_http_client`].
//! 4. Observe how transport failures surface as [`Error::AuthenticationFailed`] once an endpoint
//!    is configured.

// std
use std::{
	error::Error as StdError,
	fmt::{Display, Formatter, Result as FmtResult},
	future::Future,
	pin::Pin,
	sync::Arc,
};
// crates.io
use color_eyre::Result;
use time::{Duration, OffsetDateTime};
// self
use managed_identity_broker::{
	CancellationToken,
	auth::TokenRequestContext,
	credential::{ManagedIdentityCredential, ManagedIdentityOptions},
	env::MapEnvironment,
	error::{Error, TransportError},
	exchange::{self, TransportErrorMapper},
	http::{
		ResponseMetadata, ResponseMetadataSlot, TokenHttpClient,
		oauth2::{AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse},
	},
	retry::RetryPolicy,
	url::Url,
};

type MockCredential = ManagedIdentityCredential<MockHttpClient, MockTransportErrorMapper>;

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let context = TokenRequestContext::new(["https://management.azure.com/.default"])?;
	let cancel = CancellationToken::new();
	let credential = build_credential(MockHttpClient::success())?;
	let token = credential.get_token(&context, &cancel).await?;

	println!("Access token issued by the mock transport: {}.", token.token().expose());

	let failing = build_credential(MockHttpClient::transport_error(
		MockTransportError::ConnectionReset { peer: "169.254.169.254" },
	))?;

	match failing.get_token(&context, &cancel).await {
		Ok(_) => println!("Mock transport unexpectedly succeeded."),
		Err(e @ Error::AuthenticationFailed(_)) => println!("Transport error mapped: {e}"),
		Err(e) => println!("Unexpected classification: {e}"),
	}

	let other = build_credential(MockHttpClient::other_error("agent closed the pipe"))?;

	match other.get_token(&context, &cancel).await {
		Ok(_) => println!("Mock transport unexpectedly produced a token."),
		Err(e) => println!("An HttpClientError::Other variant made it through the mapper: {e}"),
	}

	Ok(())
}

fn build_credential(client: MockHttpClient) -> Result<MockCredential> {
	let options = ManagedIdentityOptions::builder()
		.environment(Arc::new(MapEnvironment::new()))
		.imds_endpoint(Url::parse("http://169.254.169.254/metadata/identity/oauth2/token")?)
		.retry(RetryPolicy::no_retry())
		.build()?;

	Ok(ManagedIdentityCredential::with_http_client(options, client, MockTransportErrorMapper))
}

#[derive(Clone, Debug)]
enum MockTransportError {
	ConnectionReset { peer: &'static str },
}
impl Display for MockTransportError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::ConnectionReset { peer } => write!(f, "connection reset by {peer}"),
		}
	}
}
impl StdError for MockTransportError {}

#[derive(Clone)]
enum MockBehavior {
	Success,
	TransportError(MockTransportError),
	Other(&'static str),
}

#[derive(Clone)]
struct MockHttpClient {
	behavior: MockBehavior,
}
impl MockHttpClient {
	fn success() -> Self {
		Self { behavior: MockBehavior::Success }
	}

	fn transport_error(error: MockTransportError) -> Self {
		Self { behavior: MockBehavior::TransportError(error) }
	}

	fn other_error(message: &'static str) -> Self {
		Self { behavior: MockBehavior::Other(message) }
	}
}
impl TokenHttpClient for MockHttpClient {
	type Handle = MockHttpHandle;
	type TransportError = MockTransportError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		MockHttpHandle { slot, behavior: self.behavior.clone() }
	}
}

struct MockHttpHandle {
	slot: ResponseMetadataSlot,
	behavior: MockBehavior,
}
impl<'a> AsyncHttpClient<'a> for MockHttpHandle {
	type Error = HttpClientError<MockTransportError>;
	type Future =
		Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'a + Send + Sync>>;

	fn call(&'a self, _request: HttpRequest) -> Self::Future {
		let slot = self.slot.clone();
		let behavior = self.behavior.clone();

		Box::pin(async move {
			slot.take();

			match behavior {
				MockBehavior::Success => {
					let expires_on =
						(OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp();

					slot.store(ResponseMetadata { status: Some(200), retry_after: None });

					Ok(HttpResponse::new(
						format!("{{\"access_token\":\"mock-access\",\"expires_on\":{expires_on}}}")
							.into_bytes(),
					))
				},
				MockBehavior::TransportError(error) => {
					// `HttpClientError::Reqwest` carries any boxed transport error.
					Err(HttpClientError::Reqwest(Box::new(error)))
				},
				MockBehavior::Other(message) => {
					slot.store(ResponseMetadata { status: Some(502), retry_after: None });

					Err(HttpClientError::Other(message.to_owned()))
				},
			}
		})
	}
}

#[derive(Clone, Debug, Default)]
struct MockTransportErrorMapper;
impl TransportErrorMapper<MockTransportError> for MockTransportErrorMapper {
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<MockTransportError>,
	) -> TransportError {
		match error {
			HttpClientError::Reqwest(inner) => TransportError::network(*inner),
			HttpClientError::Http(inner) => TransportError::request(inner),
			HttpClientError::Io(inner) => inner.into(),
			HttpClientError::Other(message) => exchange::generic_transport_error(metadata, message),
			_ => exchange::generic_transport_error(metadata, "unrecognized mock failure"),
		}
	}
}
