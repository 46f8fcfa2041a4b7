//! App Service and Functions secret-header probe.

// crates.io
use oauth2::{HttpRequest, http::Method};
// self
use crate::{
	_prelude::*,
	auth::ClientIdentityConfig,
	env::{Environment, vars},
	probe::{
		self, EndpointBinding, IdentityProbe, ManagedIdentitySource, ProbeContext, ProbeFuture,
		ProbeOutcome,
	},
};

/// `api-version` for the `IDENTITY_ENDPOINT`/`IDENTITY_HEADER` convention.
pub const IDENTITY_API_VERSION: &str = "2019-08-01";
/// Header carrying `IDENTITY_HEADER`.
pub const IDENTITY_SECRET_HEADER: &str = "X-IDENTITY-HEADER";
/// `api-version` for the legacy `MSI_ENDPOINT`/`MSI_SECRET` convention.
pub const MSI_API_VERSION: &str = "2017-09-01";
/// Header carrying `MSI_SECRET`.
pub const MSI_SECRET_HEADER: &str = "secret";

/// Detects App Service from an endpoint/secret pair.
///
/// The `IDENTITY_*` pair wins when both conventions are exported. Detection is a pure
/// environment check.
#[derive(Clone, Copy, Debug, Default)]
pub struct AppServiceProbe;
impl AppServiceProbe {
	fn binding(env: &dyn Environment) -> Result<Option<EndpointBinding>> {
		let pairs = [
			(
				vars::IDENTITY_ENDPOINT,
				vars::IDENTITY_HEADER,
				IDENTITY_API_VERSION,
				IDENTITY_SECRET_HEADER,
			),
			(vars::MSI_ENDPOINT, vars::MSI_SECRET, MSI_API_VERSION, MSI_SECRET_HEADER),
		];

		for (endpoint_var, secret_var, api_version, header) in pairs {
			let (Some(endpoint), Some(secret)) = (env.var(endpoint_var), env.var(secret_var)) else {
				continue;
			};
			let binding = EndpointBinding::new(probe::parse_endpoint(&endpoint)?)
				.with_api_version(api_version)
				.with_secret_header(header, secret);

			return Ok(Some(binding));
		}

		Ok(None)
	}
}
impl IdentityProbe for AppServiceProbe {
	fn source(&self) -> ManagedIdentitySource {
		ManagedIdentitySource::AppService
	}

	fn detect<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a> {
		Box::pin(async move {
			Ok(match Self::binding(ctx.env)? {
				Some(binding) => ProbeOutcome::Present(binding),
				None => ProbeOutcome::Absent,
			})
		})
	}

	fn build_request(
		&self,
		binding: &EndpointBinding,
		resource: &str,
		identity: &ClientIdentityConfig,
	) -> Result<HttpRequest> {
		let url = binding.token_url(resource, identity);
		let headers = probe::secret_header_pair(binding).into_iter().collect::<Vec<_>>();

		probe::build_http_request(Method::GET, &url, &headers, Vec::new())
	}
}
