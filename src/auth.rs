//! Auth-domain identifiers, scope sets, request contexts, and token models.

pub mod context;
pub mod id;
pub mod identity;
pub mod scope;
pub mod token;

pub use context::*;
pub use id::*;
pub use identity::*;
pub use scope::*;
pub use token::{access::*, secret::*};
