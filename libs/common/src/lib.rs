pub mod id;
pub mod model;
pub mod scope;

pub use id::PrefixedId;
pub use scope::{dm_scope_id, ScopeKind};
