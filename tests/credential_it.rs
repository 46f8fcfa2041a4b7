mod common;

// std
use std::{
	fs,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	},
	time::Duration as StdDuration,
};
// crates.io
use time::{Duration, OffsetDateTime};
// self
use common::*;
use managed_identity_broker::{
	CancellationToken,
	auth::{ClientId, TokenRequestContext},
	env::{MapEnvironment, vars},
	error::{AuthenticationError, ConfigError, Error},
	probe::{ArcProbe, IdentityProbe, ManagedIdentitySource},
	url::Url,
};

const IMDS_PROBE_URL: &str =
	"http://169.254.169.254/metadata/identity/oauth2/token?api-version=2018-02-01";

fn app_service_env() -> MapEnvironment {
	MapEnvironment::new().with(vars::MSI_ENDPOINT, "https://mock/").with(vars::MSI_SECRET, "s1")
}

/// IMDS answers bare probes with 400 and token requests with `reply`.
fn imds_responder(reply: Reply) -> impl Fn(&RecordedRequest) -> Reply + Send + Sync {
	move |request| {
		if is_network_probe(request) {
			Reply::status(
				400,
				"{\"error\":\"invalid_request\",\"error_description\":\"Required metadata header not specified\"}",
			)
		} else {
			reply.clone()
		}
	}
}

#[tokio::test]
async fn app_service_msi_pair_returns_a_token_expiring_after_the_exchange() {
	let client = ScriptedHttpClient::always(Reply::token("tok1", Duration::hours(1)));
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);
	let before = OffsetDateTime::now_utc();
	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("App Service exchange should succeed.");

	assert_eq!(token.token().expose(), "tok1");
	assert!(token.expires_on() > before);
	assert_eq!(credential.source(), Some(ManagedIdentitySource::AppService));

	let requests = client.requests();

	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].method, "GET");
	assert_eq!(
		requests[0].url,
		"https://mock/?api-version=2017-09-01&resource=https%3A%2F%2Fvault.azure.net"
	);
	assert_eq!(requests[0].header("secret"), Some("s1"));
}

#[tokio::test]
async fn identity_header_pair_wins_over_the_msi_pair() {
	let env = app_service_env()
		.with(vars::IDENTITY_ENDPOINT, "http://127.0.0.1:41000/msi/token")
		.with(vars::IDENTITY_HEADER, "h1");
	let client = ScriptedHttpClient::always(Reply::token("tok2", Duration::hours(1)));
	let credential = build_credential(Arc::new(env), &client, |builder| builder);

	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("App Service exchange should succeed.");

	let request = &client.requests()[0];

	assert!(request.url.starts_with("http://127.0.0.1:41000/msi/token?api-version=2019-08-01&"));
	assert_eq!(request.header("x-identity-header"), Some("h1"));
	assert_eq!(request.header("secret"), None);
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() {
	let client = ScriptedHttpClient::with_latency(StdDuration::from_millis(50), |_| {
		Reply::token("shared", Duration::hours(1))
	});
	let credential = Arc::new(build_credential(Arc::new(app_service_env()), &client, |b| b));
	let mut handles = Vec::new();

	for _ in 0..8 {
		let credential = credential.clone();

		handles.push(tokio::spawn(async move {
			credential.get_token(&vault_context(), &CancellationToken::new()).await
		}));
	}

	for handle in handles {
		let token = handle
			.await
			.expect("Caller task should not panic.")
			.expect("Every caller should receive the token.");

		assert_eq!(token.token().expose(), "shared");
	}

	assert_eq!(client.requests().len(), 1);
	assert_eq!(credential.metrics().exchanges(), 1);
	assert_eq!(credential.metrics().cache_hits(), 7);
}

async fn run_concurrent_callers(credential: &Arc<TestCredential>, callers: usize) -> Vec<Error> {
	let mut handles = Vec::new();

	for _ in 0..callers {
		let credential = credential.clone();

		handles.push(tokio::spawn(async move {
			credential.get_token(&vault_context(), &CancellationToken::new()).await
		}));
	}

	let mut errors = Vec::new();

	for handle in handles {
		errors.push(
			handle
				.await
				.expect("Caller task should not panic.")
				.expect_err("Every caller should observe the failure."),
		);
	}

	errors
}

#[tokio::test]
async fn concurrent_callers_share_one_rejected_exchange() {
	let client = ScriptedHttpClient::with_latency(StdDuration::from_millis(50), |_| {
		Reply::status(
			400,
			"{\"error\":\"invalid_request\",\"error_description\":\"Identity not found\"}",
		)
	});
	let credential = Arc::new(build_credential(Arc::new(app_service_env()), &client, |b| b));
	let errors = run_concurrent_callers(&credential, 8).await;

	for err in &errors {
		match err {
			Error::AuthenticationFailed(AuthenticationError::Status { status, message, .. }) => {
				assert_eq!(*status, 400);
				assert_eq!(message, "Identity not found");
			},
			other => panic!("Unexpected error: {other:?}."),
		}
	}

	assert_eq!(client.requests().len(), 1);
	assert_eq!(credential.metrics().exchanges(), 1);
	assert_eq!(credential.metrics().failures(), 8);
	assert!(credential.cache().peek().is_none());
}

#[tokio::test]
async fn concurrent_callers_share_one_exhausted_retry_loop() {
	let client = ScriptedHttpClient::with_latency(StdDuration::from_millis(20), |_| {
		Reply::status(503, "{\"error\":\"temporarily_unavailable\"}")
	});
	let credential = Arc::new(build_credential(Arc::new(app_service_env()), &client, |b| b));
	let errors = run_concurrent_callers(&credential, 6).await;

	assert!(errors.iter().all(|err| err.status() == Some(503)));
	// One retry loop of three attempts, not one per caller.
	assert_eq!(client.requests().len(), 3);
	assert_eq!(credential.metrics().exchanges(), 1);
}

#[tokio::test]
async fn callers_arriving_after_a_failure_try_again() {
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();
	let client = ScriptedHttpClient::new(move |_| {
		if counter.fetch_add(1, Ordering::SeqCst) == 0 {
			Reply::status(400, "{\"error\":\"invalid_request\"}")
		} else {
			Reply::token("second-try", Duration::hours(1))
		}
	});
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);

	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("First exchange should be rejected.");

	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("A later caller should run its own exchange.");

	assert_eq!(token.token().expose(), "second-try");
	assert_eq!(client.requests().len(), 2);
	assert_eq!(credential.metrics().exchanges(), 2);
}

#[tokio::test]
async fn malformed_endpoint_variables_fail_detection_as_config_errors() {
	let env = MapEnvironment::new()
		.with(vars::IDENTITY_ENDPOINT, "not a url")
		.with(vars::IDENTITY_HEADER, "h1");
	let client = ScriptedHttpClient::always(Reply::token("unused", Duration::hours(1)));
	let credential = build_credential(Arc::new(env), &client, |builder| builder);
	let err = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("A malformed endpoint should fail the call.");

	assert!(matches!(err, Error::Config(ConfigError::InvalidEndpoint { .. })));
	assert_eq!(credential.source(), None);
	assert!(client.requests().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_detection_probes_once_across_keys() {
	let client = ScriptedHttpClient::with_latency(
		StdDuration::from_millis(50),
		imds_responder(Reply::token("imds", Duration::hours(1))),
	);
	let credential = Arc::new(build_credential(Arc::new(MapEnvironment::new()), &client, |b| b));
	let mut handles = Vec::new();

	for i in 0..6 {
		let credential = credential.clone();

		handles.push(tokio::spawn(async move {
			let context = TokenRequestContext::new([format!("https://res{i}.example/.default")])
				.expect("Scope fixture should be valid.");

			credential.get_token(&context, &CancellationToken::new()).await
		}));
	}

	for handle in handles {
		handle
			.await
			.expect("Caller task should not panic.")
			.expect("Every caller should receive a token.");
	}

	let requests = client.requests();

	assert_eq!(credential.detection_state().probe_runs(), 1);
	assert_eq!(requests.iter().filter(|request| is_network_probe(request)).count(), 1);
	assert_eq!(client.token_requests().len(), 6);
	assert_eq!(credential.source(), Some(ManagedIdentitySource::Imds));
}

#[tokio::test]
async fn detection_is_memoized_even_when_the_environment_changes() {
	let env = CountingEnvironment::new(app_service_env());
	let client = ScriptedHttpClient::always(Reply::token("tok1", Duration::hours(1)));
	let credential = build_credential(Arc::new(env.clone()), &client, |builder| builder);

	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("First exchange should succeed.");

	let reads_after_detection = env.reads();

	env.inner.remove(vars::MSI_ENDPOINT);
	env.inner.remove(vars::MSI_SECRET);
	credential.clear_cache();
	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("Second exchange should reuse the stored detection.");

	assert_eq!(env.reads(), reads_after_detection);
	assert_eq!(credential.detection_state().probe_runs(), 1);
	assert!(client.requests().iter().all(|request| request.url.starts_with("https://mock/")));

	credential.reset_detection();
	credential.clear_cache();
	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("A reset should probe the emptied environment again.");

	let requests = client.requests();

	assert_eq!(credential.source(), Some(ManagedIdentitySource::Imds));
	assert_eq!(credential.detection_state().probe_runs(), 2);
	assert!(
		requests.last().is_some_and(|request| request.url.starts_with("http://169.254.169.254/"))
	);
}

#[tokio::test]
async fn imds_timeout_is_unavailable_before_any_retry() {
	let client = ScriptedHttpClient::always(Reply::Hang);
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| {
		builder.probe_timeout(Duration::milliseconds(50))
	});
	let err = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("A silent instance metadata service means no identity.");

	assert!(matches!(err, Error::CredentialUnavailable { .. }));
	assert_eq!(credential.source(), Some(ManagedIdentitySource::Unavailable));

	let requests = client.requests();

	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].url, IMDS_PROBE_URL);
	assert_eq!(requests[0].header("Metadata"), None);
}

#[tokio::test]
async fn unreachable_imds_is_unavailable() {
	let client = ScriptedHttpClient::always(Reply::Unreachable);
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| builder);
	let err = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("Unreachable endpoint should be unavailable.");

	assert!(matches!(err, Error::CredentialUnavailable { .. }));
	assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn imds_token_requests_carry_metadata_and_the_client_id() {
	let client = ScriptedHttpClient::new(imds_responder(Reply::token("imds", Duration::hours(1))));
	let client_id = ClientId::new("mi-client").expect("Client id fixture should be valid.");
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| {
		builder.identity(client_id)
	});
	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("IMDS exchange should succeed.");

	assert_eq!(token.token().expose(), "imds");
	assert_eq!(credential.source(), Some(ManagedIdentitySource::Imds));

	let token_requests = client.token_requests();

	assert_eq!(client.requests().len(), 2);
	assert_eq!(token_requests.len(), 1);
	assert_eq!(token_requests[0].method, "GET");
	assert_eq!(token_requests[0].header("Metadata"), Some("true"));
	assert_eq!(
		token_requests[0].query(),
		Some("api-version=2018-02-01&resource=https%3A%2F%2Fvault.azure.net&client_id=mi-client")
	);
}

#[tokio::test]
async fn configured_imds_endpoint_skips_the_probe() {
	let client = ScriptedHttpClient::always(Reply::token("override", Duration::hours(1)));
	let endpoint = Url::parse("http://127.0.0.1:8181/metadata/identity/oauth2/token")
		.expect("Endpoint fixture should parse.");
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| {
		builder.imds_endpoint(endpoint)
	});

	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("Configured endpoint should be used directly.");

	let requests = client.requests();

	assert_eq!(requests.len(), 1);
	assert!(requests[0].url.starts_with("http://127.0.0.1:8181/metadata/identity/oauth2/token?"));
	assert_eq!(requests[0].header("Metadata"), Some("true"));
}

#[tokio::test]
async fn rejected_requests_surface_the_status_without_retrying() {
	let client = ScriptedHttpClient::new(imds_responder(Reply::status(
		400,
		"{\"error\":\"invalid_resource\",\"error_description\":\"Resource is not registered\"}",
	)));
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| builder);
	let err = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("HTTP 400 should fail the call.");

	assert_eq!(err.status(), Some(400));

	match err {
		Error::AuthenticationFailed(AuthenticationError::Status { message, .. }) =>
			assert_eq!(message, "Resource is not registered"),
		other => panic!("Unexpected error: {other:?}."),
	}

	assert_eq!(client.token_requests().len(), 1);
	assert!(credential.cache().peek().is_none());
	assert_eq!(credential.metrics().failures(), 1);
}

#[tokio::test]
async fn server_errors_are_retried_until_success() {
	let calls = Arc::new(AtomicUsize::new(0));
	let counter = calls.clone();
	let client = ScriptedHttpClient::new(move |_| {
		if counter.fetch_add(1, Ordering::SeqCst) < 2 {
			Reply::status(503, "{\"error\":\"temporarily_unavailable\"}")
		} else {
			Reply::token("after-retry", Duration::hours(1))
		}
	});
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);
	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("The third attempt should succeed.");

	assert_eq!(token.token().expose(), "after-retry");
	assert_eq!(client.requests().len(), 3);
	assert_eq!(credential.metrics().exchanges(), 1);
}

#[tokio::test]
async fn exhausted_retries_report_the_last_failure() {
	let client = ScriptedHttpClient::always(Reply::status(500, "upstream exploded"));
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);
	let err = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect_err("Persistent server errors should fail.");

	assert_eq!(err.status(), Some(500));
	assert_eq!(client.requests().len(), 3);
}

#[tokio::test]
async fn cloud_shell_posts_a_form_body() {
	let env = MapEnvironment::new().with(vars::MSI_ENDPOINT, "http://localhost:50342/oauth2/token");
	let client = ScriptedHttpClient::always(Reply::token("shell", Duration::hours(1)));
	let credential = build_credential(Arc::new(env), &client, |builder| builder);

	credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("Cloud Shell exchange should succeed.");

	let requests = client.requests();

	assert_eq!(credential.source(), Some(ManagedIdentitySource::CloudShell));
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].method, "POST");
	assert_eq!(requests[0].url, "http://localhost:50342/oauth2/token");
	assert_eq!(requests[0].body, "resource=https%3A%2F%2Fvault.azure.net");
	assert_eq!(requests[0].header("content-type"), Some("application/x-www-form-urlencoded"));
	assert_eq!(requests[0].header("Metadata"), Some("true"));
}

#[tokio::test]
async fn arc_challenge_is_answered_with_the_key_file() {
	let dir = std::env::temp_dir().join(format!("mi-broker-arc-it-{}", std::process::id()));

	fs::create_dir_all(&dir).expect("Key directory should be creatable.");

	let key_path = dir.join("agent.key");

	fs::write(&key_path, "arc-secret").expect("Key file should be writable.");

	let realm = format!("Basic realm={}", key_path.display());
	let client = ScriptedHttpClient::new(move |request| match request.header("Authorization") {
		Some("Basic arc-secret") => Reply::token("arc", Duration::hours(1)),
		_ => Reply::status(401, "").with_header("www-authenticate", realm.clone()),
	});
	let env = MapEnvironment::new()
		.with(vars::IDENTITY_ENDPOINT, "http://localhost:40342/metadata/identity/oauth2/token")
		.with(vars::IMDS_ENDPOINT, "http://localhost:40342");
	let probe: Arc<dyn IdentityProbe> = Arc::new(ArcProbe::with_key_directory(&dir));
	let credential = build_credential(Arc::new(env), &client, |builder| builder.probes([probe]));
	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("Arc exchange should succeed after the challenge.");
	let requests = client.requests();

	assert_eq!(token.token().expose(), "arc");
	assert_eq!(credential.source(), Some(ManagedIdentitySource::Arc));
	assert_eq!(requests.len(), 2);
	assert_eq!(requests[0].header("Authorization"), None);
	assert!(requests[1].url.contains("api-version=2019-11-01"));

	let _ = fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn tokens_inside_the_safety_margin_are_fetched_again() {
	let client = ScriptedHttpClient::always(Reply::token("short", Duration::seconds(100)));
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);

	for _ in 0..2 {
		credential
			.get_token(&vault_context(), &CancellationToken::new())
			.await
			.expect("Exchange should succeed.");
	}

	assert_eq!(client.requests().len(), 2);

	let client = ScriptedHttpClient::always(Reply::token("short", Duration::seconds(100)));
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| {
		builder.safety_margin(Duration::seconds(60))
	});

	for _ in 0..2 {
		credential
			.get_token(&vault_context(), &CancellationToken::new())
			.await
			.expect("Exchange should succeed.");
	}

	assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn switching_resources_replaces_the_cached_token() {
	let client = ScriptedHttpClient::always(Reply::token("tok", Duration::hours(1)));
	let credential = build_credential(Arc::new(app_service_env()), &client, |builder| builder);
	let storage = TokenRequestContext::new(["https://storage.azure.com/.default"])
		.expect("Storage scope should be valid.");

	for context in [vault_context(), storage, vault_context()] {
		credential
			.get_token(&context, &CancellationToken::new())
			.await
			.expect("Exchange should succeed.");
	}

	assert_eq!(client.requests().len(), 3);
}

#[tokio::test]
async fn cancelling_an_exchange_keeps_the_detection() {
	let client = ScriptedHttpClient::always(Reply::Hang);
	let credential = Arc::new(build_credential(Arc::new(app_service_env()), &client, |b| b));
	let cancel = CancellationToken::new();
	let task = {
		let credential = credential.clone();
		let cancel = cancel.clone();

		tokio::spawn(async move { credential.get_token(&vault_context(), &cancel).await })
	};

	tokio::time::sleep(StdDuration::from_millis(30)).await;
	cancel.cancel();

	let err = task
		.await
		.expect("Caller task should not panic.")
		.expect_err("Cancellation should abort the exchange.");

	assert!(matches!(err, Error::Cancelled));
	assert_eq!(credential.source(), Some(ManagedIdentitySource::AppService));
	assert!(credential.cache().peek().is_none());
}

#[tokio::test]
async fn cancelling_detection_leaves_it_resolvable() {
	let hanging = Arc::new(AtomicBool::new(true));
	let switch = hanging.clone();
	let client = ScriptedHttpClient::new(move |request| {
		if switch.load(Ordering::SeqCst) {
			Reply::Hang
		} else {
			imds_responder(Reply::token("late", Duration::hours(1)))(request)
		}
	});
	let credential = build_credential(Arc::new(MapEnvironment::new()), &client, |builder| {
		builder.probe_timeout(Duration::seconds(10))
	});
	let cancel = CancellationToken::new();
	let canceller = {
		let cancel = cancel.clone();

		tokio::spawn(async move {
			tokio::time::sleep(StdDuration::from_millis(30)).await;
			cancel.cancel();
		})
	};
	let err = credential
		.get_token(&vault_context(), &cancel)
		.await
		.expect_err("Cancellation should abort detection.");

	canceller.await.expect("Canceller task should not panic.");

	assert!(matches!(err, Error::Cancelled));
	assert_eq!(credential.source(), None);

	hanging.store(false, Ordering::SeqCst);

	let token = credential
		.get_token(&vault_context(), &CancellationToken::new())
		.await
		.expect("A fresh call should detect and exchange.");

	assert_eq!(token.token().expose(), "late");
	assert_eq!(credential.source(), Some(ManagedIdentitySource::Imds));
}
