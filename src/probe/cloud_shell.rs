//! Cloud Shell local MSI endpoint probe.

// crates.io
use oauth2::{
	HttpRequest,
	http::{Method, header::CONTENT_TYPE},
};
use url::form_urlencoded::Serializer;
// self
use crate::{
	_prelude::*,
	auth::ClientIdentityConfig,
	env::vars,
	probe::{
		self, EndpointBinding, IdentityProbe, ManagedIdentitySource, ProbeContext, ProbeFuture,
		ProbeOutcome,
	},
};

/// Detects Cloud Shell: `MSI_ENDPOINT` without `MSI_SECRET`.
///
/// Token requests are form-encoded `POST`s carrying the resource in the body.
#[derive(Clone, Copy, Debug, Default)]
pub struct CloudShellProbe;
impl IdentityProbe for CloudShellProbe {
	fn source(&self) -> ManagedIdentitySource {
		ManagedIdentitySource::CloudShell
	}

	fn detect<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a> {
		Box::pin(async move {
			if ctx.env.var(vars::MSI_SECRET).is_some() {
				return Ok(ProbeOutcome::Absent);
			}

			Ok(match ctx.env.var(vars::MSI_ENDPOINT) {
				Some(endpoint) =>
					ProbeOutcome::Present(EndpointBinding::new(probe::parse_endpoint(&endpoint)?)),
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
		let mut form = Serializer::new(String::new());

		form.append_pair("resource", resource);

		if let Some((name, value)) = identity.query_pair() {
			form.append_pair(name, value);
		}

		probe::build_http_request(
			Method::POST,
			&binding.endpoint,
			&[
				(CONTENT_TYPE.as_str(), "application/x-www-form-urlencoded"),
				("Metadata", "true"),
			],
			form.finish().into_bytes(),
		)
	}
}
