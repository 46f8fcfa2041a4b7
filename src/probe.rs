//! Endpoint probes: one per hosting environment flavor.
//!
//! A probe answers two questions. [`IdentityProbe::detect`] decides whether its flavor of
//! identity endpoint exists here and, if so, captures everything needed to call it in an
//! [`EndpointBinding`]. [`IdentityProbe::build_request`] turns that binding into a token
//! request for one resource. Probes are trait objects so hosts can supply their own list.

pub mod app_service;
pub mod arc;
pub mod cloud_shell;
pub mod imds;

pub use app_service::AppServiceProbe;
pub use arc::ArcProbe;
pub use cloud_shell::CloudShellProbe;
pub use imds::ImdsProbe;

// crates.io
use oauth2::{
	HttpRequest, HttpResponse,
	http::{Method, Request},
};
// self
use crate::{
	_prelude::*,
	auth::{ClientIdentityConfig, TokenSecret},
	env::Environment,
	error::ConfigError,
	http::IdentityTransport,
};

/// Boxed future returned by [`IdentityProbe::detect`].
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<ProbeOutcome>> + 'a + Send>>;
/// Boxed future returned by [`IdentityProbe::answer_challenge`].
pub type ChallengeFuture<'a> =
	Pin<Box<dyn Future<Output = Result<Option<HttpRequest>>> + 'a + Send>>;

/// Flavor of managed identity endpoint selected for a detection scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ManagedIdentitySource {
	/// Instance metadata service on virtual machines and pods.
	Imds,
	/// App Service and Functions secret-header endpoint.
	AppService,
	/// Cloud Shell local MSI endpoint.
	CloudShell,
	/// Arc-enabled server agent.
	Arc,
	/// No probe found an endpoint.
	Unavailable,
}
impl ManagedIdentitySource {
	/// Stable label used in logs and metrics.
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Imds => "imds",
			Self::AppService => "app_service",
			Self::CloudShell => "cloud_shell",
			Self::Arc => "arc",
			Self::Unavailable => "unavailable",
		}
	}
}
impl Display for ManagedIdentitySource {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(self.as_str())
	}
}

/// Header carrying an endpoint secret captured from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretHeader {
	/// Header name.
	pub name: &'static str,
	/// Redacted header value.
	pub value: TokenSecret,
}

/// Everything needed to call a detected endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointBinding {
	/// Token endpoint URL without query parameters added by the broker.
	pub endpoint: Url,
	/// `api-version` query value, when the flavor uses one.
	pub api_version: Option<&'static str>,
	/// Secret header to attach to token requests.
	pub secret_header: Option<SecretHeader>,
	/// The endpoint came from explicit configuration instead of discovery.
	pub configured: bool,
}
impl EndpointBinding {
	/// Creates a binding for `endpoint`.
	pub fn new(endpoint: Url) -> Self {
		Self { endpoint, api_version: None, secret_header: None, configured: false }
	}

	/// Sets the `api-version` query value.
	pub fn with_api_version(mut self, api_version: &'static str) -> Self {
		self.api_version = Some(api_version);

		self
	}

	/// Attaches a secret header.
	pub fn with_secret_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
		self.secret_header = Some(SecretHeader { name, value: TokenSecret::new(value) });

		self
	}

	/// Marks the endpoint as explicitly configured.
	pub fn with_configured(mut self, configured: bool) -> Self {
		self.configured = configured;

		self
	}

	/// Token URL carrying `api-version`, `resource`, and the identity selector.
	pub fn token_url(&self, resource: &str, identity: &ClientIdentityConfig) -> Url {
		let mut url = self.endpoint.clone();

		{
			let mut query = url.query_pairs_mut();

			if let Some(api_version) = self.api_version {
				query.append_pair("api-version", api_version);
			}

			query.append_pair("resource", resource);

			if let Some((name, value)) = identity.query_pair() {
				query.append_pair(name, value);
			}
		}

		url
	}
}

/// Result of running a probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
	/// The endpoint exists.
	Present(EndpointBinding),
	/// Nothing of this flavor exists here.
	Absent,
}

/// Inputs shared by every probe during detection.
#[derive(Clone, Copy)]
pub struct ProbeContext<'a> {
	/// Environment variables.
	pub env: &'a dyn Environment,
	/// Transport for probes that need a network round trip.
	pub transport: &'a dyn IdentityTransport,
	/// Upper bound for a network probe.
	pub timeout: Duration,
}

/// Detection and request building for one endpoint flavor.
pub trait IdentityProbe
where
	Self: Send + Sync,
{
	/// Flavor this probe detects.
	fn source(&self) -> ManagedIdentitySource;

	/// Decides whether the endpoint exists.
	///
	/// Absence is [`ProbeOutcome::Absent`]; errors are reserved for unexpected failures and
	/// reach the caller unchanged. Network failures surface as [`Error::AuthenticationFailed`],
	/// while an endpoint variable that is set but is not a valid URL surfaces as
	/// [`Error::Config`]. Either way detection stays unresolved; a caller choosing a fallback
	/// credential should read both as "identity present but broken", unlike
	/// [`Error::CredentialUnavailable`].
	fn detect<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a>;

	/// Builds the token request for `resource`.
	fn build_request(
		&self,
		binding: &EndpointBinding,
		resource: &str,
		identity: &ClientIdentityConfig,
	) -> Result<HttpRequest>;

	/// Optionally answers a challenge carried by a failed response with a new request.
	///
	/// The default never answers.
	fn answer_challenge<'a>(
		&'a self,
		_binding: &'a EndpointBinding,
		_resource: &'a str,
		_identity: &'a ClientIdentityConfig,
		_response: &'a HttpResponse,
	) -> ChallengeFuture<'a> {
		Box::pin(async { Ok(None) })
	}
}

/// Built-in probes in priority order: App Service, Arc, Cloud Shell, instance metadata.
///
/// `imds_endpoint` overrides the instance metadata location and marks it as configured.
pub fn default_probes(imds_endpoint: Option<Url>) -> Vec<Arc<dyn IdentityProbe>> {
	let imds = match imds_endpoint {
		Some(endpoint) => ImdsProbe::with_override(endpoint),
		None => ImdsProbe::new(),
	};

	vec![
		Arc::new(AppServiceProbe),
		Arc::new(ArcProbe::new()),
		Arc::new(CloudShellProbe),
		Arc::new(imds),
	]
}

pub(crate) fn parse_endpoint(raw: &str) -> Result<Url, ConfigError> {
	Url::parse(raw.trim()).map_err(|e| ConfigError::invalid_endpoint(raw, e))
}

pub(crate) fn build_http_request(
	method: Method,
	url: &Url,
	headers: &[(&str, &str)],
	body: Vec<u8>,
) -> Result<HttpRequest> {
	let mut builder = Request::builder().method(method).uri(url.as_str());

	for (name, value) in headers {
		builder = builder.header(*name, *value);
	}

	builder.body(body).map_err(|e| ConfigError::from(e).into())
}

pub(crate) fn secret_header_pair(binding: &EndpointBinding) -> Option<(&str, &str)> {
	binding.secret_header.as_ref().map(|header| (header.name, header.value.expose()))
}
