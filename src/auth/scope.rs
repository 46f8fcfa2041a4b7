//! Scope sets and their conversion into managed identity resources.

// std
use std::{collections::BTreeSet, sync::OnceLock};
// crates.io
use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

const DEFAULT_SUFFIX: &str = "/.default";

/// Errors emitted when validating scopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ThisError)]
pub enum ScopeValidationError {
	/// Empty scope entries are not allowed.
	#[error("Scope entries cannot be empty.")]
	Empty,
	/// Scopes cannot contain embedded whitespace characters.
	#[error("Scope contains whitespace: {scope}.")]
	ContainsWhitespace {
		/// The offending scope string.
		scope: String,
	},
	/// A token request needs at least one scope.
	#[error("At least one scope is required.")]
	NoScopes,
	/// Managed identity endpoints issue tokens for exactly one resource.
	#[error("Managed identity requests accept a single scope, got {count}.")]
	MultipleScopes {
		/// Number of distinct scopes supplied.
		count: usize,
	},
}

/// Normalized scope set with a stable fingerprint cache.
///
/// Scopes are deduplicated and sorted so equality and hashing stay consistent no matter
/// the order callers list them in. The [`fingerprint`](Self::fingerprint) is a base64
/// (no padding) SHA-256 digest of the space-joined scopes, computed once.
#[derive(Default)]
pub struct ScopeSet {
	scopes: Arc<[String]>,
	fingerprint: OnceLock<String>,
}
impl ScopeSet {
	/// Creates a normalized scope set from any iterator.
	pub fn new<I, S>(scopes: I) -> Result<Self, ScopeValidationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		Ok(Self { scopes: normalize(scopes)?, fingerprint: OnceLock::new() })
	}

	/// Number of distinct scopes.
	pub fn len(&self) -> usize {
		self.scopes.len()
	}

	/// Returns true if no scopes are defined.
	pub fn is_empty(&self) -> bool {
		self.scopes.is_empty()
	}

	/// Iterator over normalized scopes.
	pub fn iter(&self) -> impl Iterator<Item = &str> {
		self.scopes.iter().map(|s| s.as_str())
	}

	/// Returns the normalized, space-delimited representation.
	pub fn normalized(&self) -> String {
		self.scopes.join(" ")
	}

	/// Stable fingerprint derived from the normalized scope list.
	pub fn fingerprint(&self) -> &str {
		self.fingerprint.get_or_init(|| {
			let digest = Sha256::digest(self.normalized().as_bytes());

			STANDARD_NO_PAD.encode(digest)
		})
	}

	/// Converts the set into the single resource URI managed identity endpoints expect.
	///
	/// A trailing `/.default` is stripped, so `https://vault.azure.net/.default` becomes
	/// `https://vault.azure.net`.
	pub fn to_resource(&self) -> Result<String, ScopeValidationError> {
		match &*self.scopes {
			[] => Err(ScopeValidationError::NoScopes),
			[scope] => Ok(scope.strip_suffix(DEFAULT_SUFFIX).unwrap_or(scope).to_owned()),
			many => Err(ScopeValidationError::MultipleScopes { count: many.len() }),
		}
	}
}
impl Clone for ScopeSet {
	fn clone(&self) -> Self {
		Self { scopes: self.scopes.clone(), fingerprint: self.fingerprint.clone() }
	}
}
impl PartialEq for ScopeSet {
	fn eq(&self, other: &Self) -> bool {
		self.scopes == other.scopes
	}
}
impl Eq for ScopeSet {}
impl Hash for ScopeSet {
	fn hash<H: Hasher>(&self, state: &mut H) {
		self.fingerprint().hash(state);
	}
}
impl Debug for ScopeSet {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.debug_tuple("ScopeSet").field(&self.scopes).finish()
	}
}
impl Display for ScopeSet {
	fn fmt(&self, f: &mut Formatter) -> FmtResult {
		f.write_str(&self.normalized())
	}
}
impl FromStr for ScopeSet {
	type Err = ScopeValidationError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.trim().is_empty() {
			return Err(ScopeValidationError::NoScopes);
		}

		Self::new(s.split_whitespace())
	}
}

fn normalize<I, S>(scopes: I) -> Result<Arc<[String]>, ScopeValidationError>
where
	I: IntoIterator<Item = S>,
	S: Into<String>,
{
	let mut set = BTreeSet::new();

	for scope in scopes {
		let owned: String = scope.into();

		if owned.is_empty() {
			return Err(ScopeValidationError::Empty);
		}
		if owned.chars().any(char::is_whitespace) {
			return Err(ScopeValidationError::ContainsWhitespace { scope: owned });
		}

		set.insert(owned);
	}

	Ok(Arc::from(set.into_iter().collect::<Vec<_>>()))
}
