//! Selection between the system-assigned identity and user-assigned identities.

// self
use crate::{
	_prelude::*,
	auth::{ClientId, ResourceId},
};

/// Which managed identity the credential asks the endpoint for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ClientIdentityConfig {
	/// The identity assigned to the hosting resource itself.
	#[default]
	SystemAssigned,
	/// A user-assigned identity selected by its client id.
	ClientId(ClientId),
	/// A user-assigned identity selected by its resource id.
	ResourceId(ResourceId),
}
impl ClientIdentityConfig {
	/// Returns `true` when a user-assigned identity is selected.
	pub fn is_user_assigned(&self) -> bool {
		!matches!(self, Self::SystemAssigned)
	}

	/// Query or form parameter identifying a user-assigned identity.
	pub fn query_pair(&self) -> Option<(&'static str, &str)> {
		match self {
			Self::SystemAssigned => None,
			Self::ClientId(id) => Some(("client_id", id.as_ref())),
			Self::ResourceId(id) => Some(("mi_res_id", id.as_ref())),
		}
	}
}
impl From<ClientId> for ClientIdentityConfig {
	fn from(value: ClientId) -> Self {
		Self::ClientId(value)
	}
}
impl From<ResourceId> for ClientIdentityConfig {
	fn from(value: ResourceId) -> Self {
		Self::ResourceId(value)
	}
}
