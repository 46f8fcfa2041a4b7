//! Environment variable access used by endpoint probes.

// self
use crate::_prelude::*;

/// Names of the variables the probes consult.
pub mod vars {
	/// Identity endpoint exported by App Service (2019 convention) and Arc agents.
	pub const IDENTITY_ENDPOINT: &str = "IDENTITY_ENDPOINT";
	/// Secret header value paired with `IDENTITY_ENDPOINT` on App Service.
	pub const IDENTITY_HEADER: &str = "IDENTITY_HEADER";
	/// Legacy App Service and Cloud Shell endpoint.
	pub const MSI_ENDPOINT: &str = "MSI_ENDPOINT";
	/// Secret paired with `MSI_ENDPOINT` on legacy App Service.
	pub const MSI_SECRET: &str = "MSI_SECRET";
	/// Instance metadata endpoint exported by Arc agents.
	pub const IMDS_ENDPOINT: &str = "IMDS_ENDPOINT";
	/// Authority host override used by pod identity deployments.
	pub const AZURE_POD_IDENTITY_AUTHORITY_HOST: &str = "AZURE_POD_IDENTITY_AUTHORITY_HOST";
}

/// Read-only view of environment variables.
///
/// Implementations must treat unset and empty variables the same way and return `None`
/// for both.
pub trait Environment
where
	Self: Send + Sync,
{
	/// Value of `name`, if set and non-empty.
	fn var(&self, name: &str) -> Option<String>;
}

/// Reads the real process environment.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessEnvironment;
impl Environment for ProcessEnvironment {
	fn var(&self, name: &str) -> Option<String> {
		std::env::var(name).ok().filter(|value| !value.is_empty())
	}
}

/// In-memory environment for tests and embedders that manage configuration themselves.
#[derive(Clone, Debug, Default)]
pub struct MapEnvironment(Arc<RwLock<HashMap<String, String>>>);
impl MapEnvironment {
	/// Creates an empty environment.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a variable and returns the environment.
	pub fn with(self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.set(name, value);

		self
	}

	/// Sets a variable in place; clones observe the change.
	pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
		self.0.write().insert(name.into(), value.into());
	}

	/// Removes a variable in place.
	pub fn remove(&self, name: &str) {
		self.0.write().remove(name);
	}
}
impl Environment for MapEnvironment {
	fn var(&self, name: &str) -> Option<String> {
		self.0.read().get(name).filter(|value| !value.is_empty()).cloned()
	}
}
impl<K, V> FromIterator<(K, V)> for MapEnvironment
where
	K: Into<String>,
	V: Into<String>,
{
	fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
		let map = iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect();

		Self(Arc::new(RwLock::new(map)))
	}
}
