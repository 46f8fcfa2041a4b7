//! Deterministic transport and environment fakes shared by the integration tests.

#![allow(dead_code)]

// std
use std::{
	fmt::{Display, Formatter, Result as FmtResult},
	future::Future,
	pin::Pin,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration as StdDuration,
};
// crates.io
use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};
// self
use managed_identity_broker::{
	auth::TokenRequestContext,
	credential::{ManagedIdentityCredential, ManagedIdentityOptions, ManagedIdentityOptionsBuilder},
	env::{Environment, MapEnvironment},
	error::TransportError,
	exchange::{self, TransportErrorMapper},
	http::{
		ResponseMetadata, ResponseMetadataSlot, TokenHttpClient,
		oauth2::{
			AsyncHttpClient, HttpClientError, HttpRequest, HttpResponse,
			http::{HeaderName, HeaderValue, StatusCode},
		},
	},
	retry::RetryPolicy,
};

/// Credential wired to the scripted transport.
pub type TestCredential =
	ManagedIdentityCredential<ScriptedHttpClient, ScriptedTransportErrorMapper>;

/// Failure raised by the scripted transport.
#[derive(Debug)]
pub enum ScriptedTransportError {
	Unreachable,
}
impl Display for ScriptedTransportError {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		match self {
			Self::Unreachable => write!(f, "Connection refused."),
		}
	}
}
impl std::error::Error for ScriptedTransportError {}

/// What the scripted transport does with a request. Header names must be lowercase.
#[derive(Clone, Debug)]
pub enum Reply {
	Response { status: u16, headers: Vec<(&'static str, String)>, body: String },
	Unreachable,
	Hang,
}
impl Reply {
	pub fn status(status: u16, body: impl Into<String>) -> Self {
		Self::Response { status, headers: Vec::new(), body: body.into() }
	}

	pub fn token(access_token: &str, lifetime: Duration) -> Self {
		let expires_on = (OffsetDateTime::now_utc() + lifetime).unix_timestamp();

		Self::status(
			200,
			format!(
				"{{\"access_token\":\"{access_token}\",\"expires_on\":\"{expires_on}\",\"token_type\":\"Bearer\"}}"
			),
		)
	}

	pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
		if let Self::Response { headers, .. } = &mut self {
			headers.push((name, value.into()));
		}

		self
	}
}

/// Snapshot of a request seen by the scripted transport.
#[derive(Clone, Debug)]
pub struct RecordedRequest {
	pub method: String,
	pub url: String,
	pub headers: Vec<(String, String)>,
	pub body: String,
}
impl RecordedRequest {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers
			.iter()
			.find(|(key, _)| key.eq_ignore_ascii_case(name))
			.map(|(_, value)| value.as_str())
	}

	pub fn query(&self) -> Option<&str> {
		self.url.split_once('?').map(|(_, query)| query)
	}
}

type Responder = dyn Fn(&RecordedRequest) -> Reply + Send + Sync;

struct Script {
	responder: Box<Responder>,
	latency: Option<StdDuration>,
	requests: Mutex<Vec<RecordedRequest>>,
}

/// [`TokenHttpClient`] answering from a closure and recording every request.
#[derive(Clone)]
pub struct ScriptedHttpClient(Arc<Script>);
impl ScriptedHttpClient {
	pub fn new<F>(responder: F) -> Self
	where
		F: 'static + Fn(&RecordedRequest) -> Reply + Send + Sync,
	{
		Self(Arc::new(Script {
			responder: Box::new(responder),
			latency: None,
			requests: Mutex::new(Vec::new()),
		}))
	}

	/// Same responder, but every reply is delayed by `latency`.
	pub fn with_latency<F>(latency: StdDuration, responder: F) -> Self
	where
		F: 'static + Fn(&RecordedRequest) -> Reply + Send + Sync,
	{
		Self(Arc::new(Script {
			responder: Box::new(responder),
			latency: Some(latency),
			requests: Mutex::new(Vec::new()),
		}))
	}

	/// Replies to every request the same way.
	pub fn always(reply: Reply) -> Self {
		Self::new(move |_| reply.clone())
	}

	pub fn requests(&self) -> Vec<RecordedRequest> {
		self.0.requests.lock().clone()
	}

	/// Requests carrying `Metadata: true` or a secret header, i.e. everything but network probes.
	pub fn token_requests(&self) -> Vec<RecordedRequest> {
		self.requests().into_iter().filter(|request| !is_network_probe(request)).collect()
	}
}
impl TokenHttpClient for ScriptedHttpClient {
	type Handle = ScriptedHandle;
	type TransportError = ScriptedTransportError;

	fn with_metadata(&self, slot: ResponseMetadataSlot) -> Self::Handle {
		ScriptedHandle { script: self.0.clone(), slot }
	}
}

pub struct ScriptedHandle {
	script: Arc<Script>,
	slot: ResponseMetadataSlot,
}
impl<'c> AsyncHttpClient<'c> for ScriptedHandle {
	type Error = HttpClientError<ScriptedTransportError>;
	type Future = Pin<Box<dyn Future<Output = Result<HttpResponse, Self::Error>> + 'c + Send>>;

	fn call(&'c self, request: HttpRequest) -> Self::Future {
		let recorded = record(&request);
		let reply = (self.script.responder)(&recorded);
		let latency = self.script.latency;
		let slot = self.slot.clone();

		self.script.requests.lock().push(recorded);

		Box::pin(async move {
			slot.take();

			if let Some(latency) = latency {
				tokio::time::sleep(latency).await;
			}

			match reply {
				Reply::Response { status, headers, body } => {
					let mut response = HttpResponse::new(body.into_bytes());

					*response.status_mut() =
						StatusCode::from_u16(status).expect("Scripted status should be valid.");

					for (name, value) in headers {
						response.headers_mut().insert(
							HeaderName::from_static(name),
							HeaderValue::from_str(&value).expect("Scripted header should be valid."),
						);
					}

					slot.store(ResponseMetadata { status: Some(status), retry_after: None });

					Ok(response)
				},
				Reply::Unreachable =>
					Err(HttpClientError::Reqwest(Box::new(ScriptedTransportError::Unreachable))),
				Reply::Hang => std::future::pending().await,
			}
		})
	}
}

/// Maps scripted failures the way the reqwest mapper maps connection errors.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransportErrorMapper;
impl TransportErrorMapper<ScriptedTransportError> for ScriptedTransportErrorMapper {
	fn map_transport_error(
		&self,
		metadata: Option<&ResponseMetadata>,
		error: HttpClientError<ScriptedTransportError>,
	) -> TransportError {
		match error {
			HttpClientError::Reqwest(inner) => TransportError::network(*inner),
			HttpClientError::Http(inner) => TransportError::request(inner),
			HttpClientError::Io(inner) => inner.into(),
			HttpClientError::Other(message) => exchange::generic_transport_error(metadata, message),
			_ => exchange::generic_transport_error(metadata, "unexpected scripted failure"),
		}
	}
}

/// Environment that counts lookups.
#[derive(Clone, Default)]
pub struct CountingEnvironment {
	pub inner: MapEnvironment,
	reads: Arc<AtomicUsize>,
}
impl CountingEnvironment {
	pub fn new(inner: MapEnvironment) -> Self {
		Self { inner, reads: Default::default() }
	}

	pub fn reads(&self) -> usize {
		self.reads.load(Ordering::SeqCst)
	}
}
impl Environment for CountingEnvironment {
	fn var(&self, name: &str) -> Option<String> {
		self.reads.fetch_add(1, Ordering::SeqCst);

		self.inner.var(name)
	}
}

pub fn fast_retry() -> RetryPolicy {
	RetryPolicy::default()
		.with_delays(Duration::milliseconds(1), Duration::milliseconds(4))
		.with_jitter(0.0)
}

pub fn build_credential<F>(
	env: Arc<dyn Environment>,
	client: &ScriptedHttpClient,
	configure: F,
) -> TestCredential
where
	F: FnOnce(ManagedIdentityOptionsBuilder) -> ManagedIdentityOptionsBuilder,
{
	let builder = ManagedIdentityOptions::builder()
		.environment(env)
		.probe_timeout(Duration::milliseconds(200))
		.retry(fast_retry());
	let options = configure(builder).build().expect("Test options should validate.");

	ManagedIdentityCredential::with_http_client(
		options,
		client.clone(),
		ScriptedTransportErrorMapper,
	)
}

pub fn vault_context() -> TokenRequestContext {
	TokenRequestContext::new(["https://vault.azure.net/.default"])
		.expect("Vault scope should be valid.")
}

pub fn is_network_probe(request: &RecordedRequest) -> bool {
	request.header("Metadata").is_none()
		&& request.header("secret").is_none()
		&& request.header("x-identity-header").is_none()
}

fn record(request: &HttpRequest) -> RecordedRequest {
	RecordedRequest {
		method: request.method().to_string(),
		url: request.uri().to_string(),
		headers: request
			.headers()
			.iter()
			.map(|(name, value)| {
				(name.as_str().to_owned(), value.to_str().unwrap_or_default().to_owned())
			})
			.collect(),
		body: String::from_utf8_lossy(request.body()).into_owned(),
	}
}
