//! Immutable description of a single token request.

// self
use crate::{
	_prelude::*,
	auth::{ScopeSet, ScopeValidationError, TenantId},
};

/// Scopes, tenant, and claims a caller wants a token for.
///
/// Managed identity endpoints mint tokens for one resource, so the orchestrator rejects
/// contexts carrying more than one scope before any network call. Claims challenges are
/// carried for callers that share contexts with other credential types; identity
/// endpoints have no parameter for them and they are not sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRequestContext {
	scopes: ScopeSet,
	tenant_id: Option<TenantId>,
	claims: Option<String>,
}
impl TokenRequestContext {
	/// Builds a context from a non-empty list of scopes.
	pub fn new<I, S>(scopes: I) -> Result<Self, ScopeValidationError>
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		let scopes = ScopeSet::new(scopes)?;

		if scopes.is_empty() {
			return Err(ScopeValidationError::NoScopes);
		}

		Ok(Self { scopes, tenant_id: None, claims: None })
	}

	/// Pins the request to a tenant.
	pub fn with_tenant_id(mut self, tenant_id: TenantId) -> Self {
		self.tenant_id = Some(tenant_id);

		self
	}

	/// Attaches a claims challenge.
	pub fn with_claims(mut self, claims: impl Into<String>) -> Self {
		let claims = claims.into();

		self.claims = if claims.is_empty() { None } else { Some(claims) };

		self
	}

	/// Normalized scopes.
	pub fn scopes(&self) -> &ScopeSet {
		&self.scopes
	}

	/// Tenant override, if any.
	pub fn tenant_id(&self) -> Option<&TenantId> {
		self.tenant_id.as_ref()
	}

	/// Claims challenge, if any.
	pub fn claims(&self) -> Option<&str> {
		self.claims.as_deref()
	}
}
