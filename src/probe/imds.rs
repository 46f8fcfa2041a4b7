//! Instance metadata service probe.

// crates.io
use oauth2::{HttpRequest, http::Method};
// self
use crate::{
	_prelude::*,
	auth::ClientIdentityConfig,
	classify,
	env::{Environment, vars},
	probe::{
		self, EndpointBinding, IdentityProbe, ManagedIdentitySource, ProbeContext, ProbeFuture,
		ProbeOutcome,
	},
	retry,
};

/// Well-known instance metadata token endpoint.
pub const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
/// `api-version` used for both probing and token requests.
pub const IMDS_API_VERSION: &str = "2018-02-01";
/// Default bound on the reachability probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::seconds(1);

const TOKEN_PATH: &str = "/metadata/identity/oauth2/token";

/// Detects the instance metadata service.
///
/// Without an override the probe sends a bare `GET ?api-version=..` (no `Metadata`
/// header) and treats any HTTP answer as presence. An override, from options or
/// `AZURE_POD_IDENTITY_AUTHORITY_HOST`, is trusted without a network call.
#[derive(Clone, Debug, Default)]
pub struct ImdsProbe {
	endpoint: Option<Url>,
	configured: bool,
}
impl ImdsProbe {
	/// Probes the well-known endpoint (or the pod identity authority host, if set).
	pub fn new() -> Self {
		Self::default()
	}

	/// Trusts `endpoint` without probing it.
	pub fn with_override(endpoint: Url) -> Self {
		Self { endpoint: Some(endpoint), configured: true }
	}

	/// Probes `endpoint` instead of the well-known address, still over the network.
	pub fn with_endpoint(endpoint: Url) -> Self {
		Self { endpoint: Some(endpoint), configured: false }
	}

	fn resolve_endpoint(&self, env: &dyn Environment) -> Result<(Url, bool)> {
		if let Some(endpoint) = &self.endpoint {
			return Ok((endpoint.clone(), self.configured));
		}
		if let Some(host) = env.var(vars::AZURE_POD_IDENTITY_AUTHORITY_HOST) {
			let raw = format!("{}{TOKEN_PATH}", host.trim_end_matches('/'));

			return Ok((probe::parse_endpoint(&raw)?, true));
		}

		Ok((probe::parse_endpoint(IMDS_ENDPOINT)?, false))
	}
}
impl IdentityProbe for ImdsProbe {
	fn source(&self) -> ManagedIdentitySource {
		ManagedIdentitySource::Imds
	}

	fn detect<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a> {
		Box::pin(async move {
			let (endpoint, configured) = self.resolve_endpoint(ctx.env)?;
			let binding = EndpointBinding::new(endpoint)
				.with_api_version(IMDS_API_VERSION)
				.with_configured(configured);

			if configured {
				return Ok(ProbeOutcome::Present(binding));
			}

			let mut url = binding.endpoint.clone();

			url.query_pairs_mut().append_pair("api-version", IMDS_API_VERSION);

			let request = probe::build_http_request(Method::GET, &url, &[], Vec::new())?;
			let send = ctx.transport.send(request);

			match tokio::time::timeout(retry::std_duration(ctx.timeout), send).await {
				Ok(Ok(_)) => Ok(ProbeOutcome::Present(binding)),
				Ok(Err(e)) => {
					classify::probe_transport_failure(e, configured)?;

					Ok(ProbeOutcome::Absent)
				},
				Err(_) => Ok(ProbeOutcome::Absent),
			}
		})
	}

	fn build_request(
		&self,
		binding: &EndpointBinding,
		resource: &str,
		identity: &ClientIdentityConfig,
	) -> Result<HttpRequest> {
		let url = binding.token_url(resource, identity);

		probe::build_http_request(Method::GET, &url, &[("Metadata", "true")], Vec::new())
	}
}
