//! Demonstrates acquiring a managed identity token with the default reqwest transport.
//!
//! A mock server plays the App Service identity endpoint, exposed to the credential through
//! an in-memory environment. On a real host, drop the `environment` override and the
//! credential reads the process environment (or probes the instance metadata service).

// std
use std::sync::Arc;
// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use time::{Duration, OffsetDateTime};
// self
use managed_identity_broker::{
	CancellationToken,
	auth::TokenRequestContext,
	credential::{ManagedIdentityOptions, ReqwestManagedIdentityCredential},
	env::{MapEnvironment, vars},
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let expires_on = (OffsetDateTime::now_utc() + Duration::hours(1)).unix_timestamp();
	let token_mock = server
		.mock_async(|when, then| {
			when.method(GET).path("/msi/token").header("x-identity-header", "demo-header");
			then.status(200).header("content-type", "application/json").body(format!(
				"{{\"access_token\":\"demo-access\",\"expires_on\":\"{expires_on}\",\"token_type\":\"Bearer\"}}"
			));
		})
		.await;
	let env = MapEnvironment::new()
		.with(vars::IDENTITY_ENDPOINT, server.url("/msi/token"))
		.with(vars::IDENTITY_HEADER, "demo-header");
	let options = ManagedIdentityOptions::builder().environment(Arc::new(env)).build()?;
	let credential = ReqwestManagedIdentityCredential::new(options)?;
	let context = TokenRequestContext::new(["https://vault.azure.net/.default"])?;
	let cancel = CancellationToken::new();
	let token = credential.get_token(&context, &cancel).await?;

	println!(
		"Token from {} expires at {}: {}.",
		credential.source().map(|source| source.as_str()).unwrap_or("unknown"),
		token.expires_on(),
		token.token().expose()
	);

	let again = credential.get_token(&context, &cancel).await?;

	println!("Second call served from cache: {}.", again == token);

	token_mock.assert_async().await;

	Ok(())
}
