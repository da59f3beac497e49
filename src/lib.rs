//! # viewmodel-cache
//!
//! In-memory normalized record cache for applications that fetch partial views of their entities from a backend.
//!
//! A UI rarely fetches a whole record: a list shows names, a detail page shows everything, a sidebar shows the name of
//! a user's group. All of these are views of the same logical records, and when one of them is refreshed the others
//! must follow. This crate keeps them consistent.
//!
//! # The Basics
//!
//! - Entity types are declared with [`EntityType::declare`] and registered with a [`CacheSystem`].
//! - Every entity type has one [`ViewModelCache`]. Records are cached per primary key and per set of fields.
//! - Adding a record updates every cached view of the same primary key it has all fields for. Reading a view that
//!   was never added is served from the most recently added record that has the fields.
//! - Relations are resolved across caches. A view including `group.name` is joined from the group cache and follows
//!   changes to the group; when the group is deleted the view goes away.
//! - Listeners are told about changes with the values before and after. Everything happening within one operation or
//!   one [`batch`](ViewModelCache::batch) reaches a listener as a single call.
//! - Values that did not change keep their identity: reading twice returns the same [`Record`] instance, and
//!   [`get_all`](ViewModelCache::get_all) returns the same vector as long as none of its records changed.
//!
//! The cache is single-threaded. Listeners run synchronously and may call back into the cache.
//!
//! # Field Paths
//!
//! Requests name fields with [`FieldPath`]: a bare name for an own field, a dotted path to traverse relations and
//! `"*"` for everything. Primary key fields, and the source id fields of requested relations, are always included.
//!
//! ```ignore
//! let system = CacheSystem::new();
//! let group = system.register(EntityType::declare("Group").field("name", CharField))?;
//! let user = system.register(
//!     EntityType::declare("User")
//!         .field("name", CharField)
//!         .field("groupId", AnyField)
//!         .relation("group", "Group", "groupId"),
//! )?;
//!
//! user.cache().add(json!({"id": 1, "name": "Jo", "group": {"id": 2, "name": "Admins"}}))?;
//! let jo = user.cache().get(1, &FieldPath::list(["name", "group.name"]))?;
//!
//! group.cache().delete(2, None)?;
//! assert!(user.cache().get(1, &FieldPath::list(["name", "group.name"]))?.is_none());
//! ```

pub mod batcher;
pub mod cache;
pub mod entity;
pub mod error;
pub mod field;
pub mod field_path;
pub mod field_set;
pub(crate) mod pointer;
pub mod record;
pub(crate) mod record_cache;
pub mod registry;
pub mod traits;
pub mod types;

#[doc(inline)]
pub use cache::ViewModelCache;
#[doc(inline)]
pub use entity::EntityType;
#[doc(inline)]
pub use error::CacheError;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use field_path::FieldPath;
#[doc(inline)]
pub use record::Record;
#[doc(inline)]
pub use registry::CacheSystem;

pub mod prelude {
    pub use crate::cache::ViewModelCache;
    pub use crate::entity::EntityDecl;
    pub use crate::entity::EntityType;
    pub use crate::error::CacheError;
    pub use crate::field::AnyField;
    pub use crate::field::BooleanField;
    pub use crate::field::CharField;
    pub use crate::field::IntegerField;
    pub use crate::field::ListField;
    pub use crate::field_path::FieldPath;
    pub use crate::field_set::FieldSet;
    pub use crate::record::FieldValue;
    pub use crate::record::Record;
    pub use crate::registry::CacheConfig;
    pub use crate::registry::CacheSystem;
    pub use crate::traits::Field;
    pub use crate::types::*;
}
