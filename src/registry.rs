use crate::{
    batcher::ListenerBatcher,
    cache::ViewModelCache,
    entity::{EntityDecl, EntityType},
    error::{CacheError, Result},
};
use fieldx::fxstruct;
use fieldx_plus::fx_plus;
use std::{collections::HashMap, fmt::Debug, rc::Rc};
use tracing::debug;

/// Settings shared by every cache of a [`CacheSystem`].
#[derive(Debug, Clone)]
#[fxstruct(builder, get)]
pub struct CacheConfig {
    /// Prefix of log messages. Most useful when more than one system lives in a process.
    #[fieldx(get(clone), builder(into), default(String::from("viewmodel-cache")))]
    name: String,

    /// Maximum number of request renderings memoized per entity type; `0` means unbounded.
    #[fieldx(get(copy), default(0))]
    descriptor_capacity: u64,

    /// Log a warning for raw data keys that are not fields of the entity type.
    #[fieldx(get(copy), default(true))]
    warn_unknown_fields: bool,
}

/// The root every entity type and cache belongs to.
///
/// Owns the type registry, the listener batcher shared by all caches and the configuration. Entity types refer back
/// to it weakly: the system must outlive any use of its types. Dropping the system empties every cache.
///
/// ```ignore
/// let system = CacheSystem::new();
/// let user = system.register(
///     EntityType::declare("User")
///         .field("name", CharField)
///         .field("groupId", AnyField)
///         .relation("group", "Group", "groupId"),
/// )?;
/// let group = system.register(EntityType::declare("Group").field("name", CharField))?;
/// system.resolve()?;
///
/// user.cache().add(json!({"id": 1, "name": "Jo", "group": {"id": 2, "name": "Admins"}}))?;
/// let jo = user.cache().get(1, &FieldPath::list(["name", "group.name"]))?;
/// ```
#[fx_plus(
    parent,
    rc,
    default(off),
    builder(
        doc("Builder object of [`CacheSystem`].", "", "See [`CacheSystem::builder()`] method."),
        method_doc("Build a [`CacheSystem`] with a custom [`CacheConfig`]."),
    )
)]
pub struct CacheSystem {
    #[fieldx(get(vis(pub)), default(CacheConfig::new()))]
    config: CacheConfig,

    #[fieldx(get(vis(pub(crate))), builder(off), default(Rc::new(ListenerBatcher::new())))]
    batcher: Rc<ListenerBatcher>,

    #[fieldx(inner_mut, private, get, get_mut, builder(off))]
    types: Vec<Rc<EntityType>>,

    #[fieldx(inner_mut, private, get, get_mut, builder(off))]
    by_name: HashMap<String, usize>,
}

impl CacheSystem {
    /// Add an entity type to the registry. Relation targets may be registered later.
    pub fn register(&self, decl: EntityDecl) -> Result<Rc<EntityType>> {
        if self.by_name().contains_key(decl.name()) {
            return Err(CacheError::DuplicateEntity(decl.name().to_string()));
        }

        let id = self.types().len();
        let entity = decl.build(self, id)?;
        debug!("[{}] registered entity type {}", self.config.name(), entity.name());

        self.types_mut().push(entity.clone());
        self.by_name_mut().insert(entity.name().clone(), id);
        Ok(entity)
    }

    pub fn entity(&self, name: &str) -> Option<Rc<EntityType>> {
        let idx = *self.by_name().get(name)?;
        self.types().get(idx).cloned()
    }

    /// Check that every relation of every registered type points to a registered type.
    pub fn resolve(&self) -> Result<()> {
        let types = self.types().clone();
        for entity in types {
            for def in entity.fields().iter().filter(|def| def.is_relation()) {
                entity.related(def.name())?;
            }
        }
        Ok(())
    }

    /// The cache of the named type.
    pub fn cache(&self, name: &str) -> Result<Rc<ViewModelCache>> {
        let entity = self
            .entity(name)
            .ok_or_else(|| CacheError::internal(format!("entity type '{name}' is not registered")))?;
        Ok(entity.cache())
    }

    /// Run `f` as one batch; listeners are notified once it returns successfully.
    pub fn batch<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _scope = self.batcher.listeners_enabled();
        self.batcher.batch(f)
    }

    /// Remove every cached record from every cache. Listeners stay registered and are told about the removals.
    pub fn clear(&self) -> Result<()> {
        let caches = self.types().iter().map(|entity| entity.cache()).collect::<Vec<_>>();
        self.batch(|| {
            for cache in &caches {
                cache.clear()?;
            }
            Ok(())
        })
    }
}

impl Drop for CacheSystem {
    fn drop(&mut self) {
        // Cached records hold their types, which own the caches.
        let types = std::mem::take(&mut *self.types_mut());
        for entity in &types {
            entity.release_cache();
        }
    }
}

impl Debug for CacheSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSystem")
            .field("config", &self.config)
            .field(
                "types",
                &self
                    .types()
                    .iter()
                    .map(|entity| entity.name().to_string())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field::{AnyField, CharField},
        field_path::FieldPath,
    };
    use serde_json::json;

    #[test]
    fn config_defaults() {
        let config = CacheConfig::new();
        assert_eq!(config.name(), "viewmodel-cache");
        assert_eq!(config.descriptor_capacity(), 0);
        assert!(config.warn_unknown_fields());

        let config = CacheConfig::builder()
            .name("custom")
            .warn_unknown_fields(false)
            .build()
            .expect("config builds");
        assert_eq!(config.name(), "custom");
        assert!(!config.warn_unknown_fields());

        let system = CacheSystem::builder().config(config).build().expect("system builds");
        assert_eq!(system.config().name(), "custom");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let system = CacheSystem::new();
        system.register(EntityType::declare("User")).unwrap();
        assert_eq!(
            system.register(EntityType::declare("User").field("x", AnyField)).unwrap_err(),
            CacheError::DuplicateEntity("User".into())
        );
    }

    #[test]
    fn one_cache_per_type() {
        let system = CacheSystem::new();
        let user = system.register(EntityType::declare("User")).unwrap();
        assert!(Rc::ptr_eq(&user.cache(), &user.cache()));
        assert!(Rc::ptr_eq(&user.cache(), &system.cache("User").unwrap()));
        assert!(system.cache("Nope").is_err());
    }

    #[test]
    fn dropping_the_system_frees_cached_records() {
        let system = CacheSystem::new();
        let user = system
            .register(EntityType::declare("User").field("name", CharField))
            .unwrap();
        let cache = user.cache();
        cache.add(json!({"id": 1, "name": "Jo"})).unwrap();
        assert!(cache.get(1, &FieldPath::list(["name"])).unwrap().is_some());

        let weak = Rc::downgrade(&user);
        drop(cache);
        drop(user);
        drop(system);
        assert!(weak.upgrade().is_none());
    }
}
