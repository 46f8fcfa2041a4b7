//! Arc-enabled server agent probe and its key-file challenge.

// std
use std::path::{Path, PathBuf};
// crates.io
use oauth2::{
	HttpRequest, HttpResponse,
	http::{Method, StatusCode, header::WWW_AUTHENTICATE},
};
// self
use crate::{
	_prelude::*,
	auth::ClientIdentityConfig,
	env::vars,
	error::{AuthenticationError, ConfigError},
	probe::{
		self, ChallengeFuture, EndpointBinding, IdentityProbe, ManagedIdentitySource, ProbeContext,
		ProbeFuture, ProbeOutcome,
	},
};

/// `api-version` understood by the Arc agent.
pub const ARC_API_VERSION: &str = "2019-11-01";
/// Largest key file the challenge handler will read.
pub const MAX_KEY_FILE_SIZE: u64 = 4096;

const KEY_EXTENSION: &str = "key";
const REALM_PREFIX: &str = "realm=";

/// Detects the Arc agent: `IDENTITY_ENDPOINT` and `IMDS_ENDPOINT` without `IDENTITY_HEADER`.
///
/// The agent answers the first token request with `401` and a
/// `WWW-Authenticate: Basic realm=<path>` header naming a key file only the local
/// administrator group can read. The probe reads that file once and re-sends the request
/// with `Authorization: Basic <key>`. Only system-assigned identities are supported.
#[derive(Clone, Debug)]
pub struct ArcProbe {
	key_directory: Option<PathBuf>,
}
impl ArcProbe {
	/// Accepts key files only from the agent's platform token directory.
	pub fn new() -> Self {
		Self { key_directory: default_key_directory() }
	}

	/// Accepts key files only from `directory`.
	pub fn with_key_directory(directory: impl Into<PathBuf>) -> Self {
		Self { key_directory: Some(directory.into()) }
	}

	fn token_request(
		&self,
		binding: &EndpointBinding,
		resource: &str,
		identity: &ClientIdentityConfig,
		authorization: Option<&str>,
	) -> Result<HttpRequest> {
		if identity.is_user_assigned() {
			return Err(ConfigError::UnsupportedIdentity { kind: "Arc" }.into());
		}

		let url = binding.token_url(resource, identity);
		let mut headers = vec![("Metadata", "true")];

		if let Some(value) = authorization {
			headers.push(("Authorization", value));
		}

		probe::build_http_request(Method::GET, &url, &headers, Vec::new())
	}

	async fn read_key(&self, response: &HttpResponse) -> Result<String, AuthenticationError> {
		let header = response
			.headers()
			.get(WWW_AUTHENTICATE)
			.and_then(|value| value.to_str().ok())
			.ok_or_else(|| challenge("response carried no WWW-Authenticate header"))?;
		let path = parse_realm(header)
			.ok_or_else(|| challenge("WWW-Authenticate header carried no Basic realm"))?;

		self.validate_path(path)?;

		let metadata = tokio::fs::metadata(path)
			.await
			.map_err(|e| challenge(format!("key file could not be inspected: {e}")))?;

		if metadata.len() > MAX_KEY_FILE_SIZE {
			return Err(challenge(format!(
				"key file is {} bytes, larger than {MAX_KEY_FILE_SIZE}",
				metadata.len()
			)));
		}

		let key = tokio::fs::read_to_string(path)
			.await
			.map_err(|e| challenge(format!("key file could not be read: {e}")))?;

		Ok(key.trim().to_owned())
	}

	fn validate_path(&self, path: &Path) -> Result<(), AuthenticationError> {
		if path.extension().and_then(|ext| ext.to_str()) != Some(KEY_EXTENSION) {
			return Err(challenge("key file must have a .key extension"));
		}

		match &self.key_directory {
			Some(directory) if path.parent() != Some(directory.as_path()) =>
				Err(challenge(format!("key file must live in {}", directory.display()))),
			_ => Ok(()),
		}
	}
}
impl Default for ArcProbe {
	fn default() -> Self {
		Self::new()
	}
}
impl IdentityProbe for ArcProbe {
	fn source(&self) -> ManagedIdentitySource {
		ManagedIdentitySource::Arc
	}

	fn detect<'a>(&'a self, ctx: ProbeContext<'a>) -> ProbeFuture<'a> {
		Box::pin(async move {
			if ctx.env.var(vars::IDENTITY_HEADER).is_some()
				|| ctx.env.var(vars::IMDS_ENDPOINT).is_none()
			{
				return Ok(ProbeOutcome::Absent);
			}

			Ok(match ctx.env.var(vars::IDENTITY_ENDPOINT) {
				Some(endpoint) => ProbeOutcome::Present(
					EndpointBinding::new(probe::parse_endpoint(&endpoint)?)
						.with_api_version(ARC_API_VERSION),
				),
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
		self.token_request(binding, resource, identity, None)
	}

	fn answer_challenge<'a>(
		&'a self,
		binding: &'a EndpointBinding,
		resource: &'a str,
		identity: &'a ClientIdentityConfig,
		response: &'a HttpResponse,
	) -> ChallengeFuture<'a> {
		Box::pin(async move {
			if response.status() != StatusCode::UNAUTHORIZED {
				return Ok(None);
			}

			let key = self.read_key(response).await?;
			let authorization = format!("Basic {key}");

			self.token_request(binding, resource, identity, Some(&authorization)).map(Some)
		})
	}
}

fn parse_realm(header: &str) -> Option<&Path> {
	let (scheme, params) = header.trim().split_once(' ')?;

	if !scheme.eq_ignore_ascii_case("basic") {
		return None;
	}

	let realm = params.trim().strip_prefix(REALM_PREFIX)?.trim_matches('"');

	if realm.is_empty() { None } else { Some(Path::new(realm)) }
}

fn challenge(reason: impl Into<String>) -> AuthenticationError {
	AuthenticationError::Challenge { reason: reason.into() }
}

fn default_key_directory() -> Option<PathBuf> {
	if cfg!(windows) {
		std::env::var_os("ProgramData")
			.map(|root| PathBuf::from(root).join("AzureConnectedMachineAgent").join("Tokens"))
	} else if cfg!(target_os = "linux") {
		Some(PathBuf::from("/var/opt/azcmagent/tokens"))
	} else {
		None
	}
}
