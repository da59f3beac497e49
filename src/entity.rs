use crate::{
    cache::ViewModelCache,
    error::{CacheError, Result},
    field::{AnyField, FieldDef, FieldKind, RelationField},
    field_path::FieldPath,
    field_set::{self, FieldSet, FieldSetMemo},
    record::Record,
    registry::CacheSystem,
    traits::Field,
    types::{PkKey, KEY_SEPARATOR},
};
use fieldx_plus::{child_build, fx_plus};
use serde_json::Value;
use std::{
    collections::HashMap,
    fmt::{Debug, Display},
    rc::Rc,
    sync::Arc,
};

const DEFAULT_PK: &str = "id";

/// Declaration of an entity type, consumed by [`CacheSystem::register`](crate::registry::CacheSystem::register).
///
/// Without an explicit primary key the type gets an `id` field, which is added as [`AnyField`] when not declared.
#[derive(Debug)]
pub struct EntityDecl {
    name:   String,
    fields: Vec<FieldDef>,
    pk:     Option<Vec<String>>,
}

impl EntityDecl {
    pub fn field(mut self, name: impl Into<String>, field: impl Field) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Scalar(Rc::new(field)),
        });
        self
    }

    /// A relation to a single record of type `to` whose primary key is stored in `source_field_name`.
    pub fn relation(
        mut self,
        name: impl Into<String>,
        to: impl Into<String>,
        source_field_name: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Relation(RelationField {
                to:                to.into(),
                source_field_name: source_field_name.into(),
                many:              false,
            }),
        });
        self
    }

    /// A relation to a list of records; `source_field_name` must be a list field.
    pub fn many_relation(
        mut self,
        name: impl Into<String>,
        to: impl Into<String>,
        source_field_name: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind: FieldKind::Relation(RelationField {
                to:                to.into(),
                source_field_name: source_field_name.into(),
                many:              true,
            }),
        });
        self
    }

    pub fn pk(mut self, name: impl Into<String>) -> Self {
        self.pk = Some(vec![name.into()]);
        self
    }

    pub fn compound_pk<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pk = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn schema_error(&self, message: impl Into<String>) -> CacheError {
        CacheError::Schema {
            entity:  self.name.clone(),
            message: message.into(),
        }
    }

    pub(crate) fn build(mut self, system: &CacheSystem, id: usize) -> Result<Rc<EntityType>> {
        if self.name.is_empty() {
            return Err(self.schema_error("entity type name must not be empty"));
        }

        let mut index = HashMap::new();
        for (idx, def) in self.fields.iter().enumerate() {
            if def.name.is_empty() || def.name == "*" || def.name.contains('.') || def.name.contains(KEY_SEPARATOR) {
                return Err(self.schema_error(format!("'{}' is not a valid field name", def.name)));
            }
            if index.insert(def.name.clone(), idx).is_some() {
                return Err(self.schema_error(format!("field '{}' is declared twice", def.name)));
            }
        }

        let pk_field_names = match self.pk.take() {
            Some(names) if names.is_empty() => {
                return Err(self.schema_error("primary key must name at least one field"));
            }
            Some(names) => names,
            None => {
                if !index.contains_key(DEFAULT_PK) {
                    index.insert(DEFAULT_PK.to_string(), self.fields.len());
                    self.fields.push(FieldDef {
                        name: DEFAULT_PK.to_string(),
                        kind: FieldKind::Scalar(Rc::new(AnyField)),
                    });
                }
                vec![DEFAULT_PK.to_string()]
            }
        };

        for pk in &pk_field_names {
            match index.get(pk).map(|idx| &self.fields[*idx]) {
                None => return Err(self.schema_error(format!("primary key field '{pk}' is not declared"))),
                Some(def) if def.is_relation() => {
                    return Err(self.schema_error(format!("primary key field '{pk}' can't be a relation")));
                }
                Some(_) => (),
            }
        }

        for def in &self.fields {
            let Some(rel) = def.relation()
            else {
                continue;
            };
            let source = index
                .get(rel.source_field_name())
                .map(|idx| &self.fields[*idx])
                .ok_or_else(|| {
                    self.schema_error(format!(
                        "relation '{}' uses source field '{}' which is not declared",
                        def.name,
                        rel.source_field_name()
                    ))
                })?;
            let Some(source_field) = source.scalar()
            else {
                return Err(self.schema_error(format!(
                    "source field '{}' of relation '{}' can't be a relation itself",
                    source.name, def.name
                )));
            };
            if rel.many() != source_field.is_list() {
                return Err(self.schema_error(format!(
                    "source field '{}' of {} relation '{}' must {}be a list field",
                    source.name,
                    if rel.many() { "many" } else { "single" },
                    def.name,
                    if rel.many() { "" } else { "not " }
                )));
            }
        }

        let is_compound = pk_field_names.len() > 1;
        let field_sets = FieldSetMemo::new(
            &format!("{}-field-sets", self.name),
            system.config().descriptor_capacity(),
        );
        child_build!(
            system,
            EntityType {
                id: id,
                name: self.name,
                fields: self.fields,
                index: index,
                pk_field_names: pk_field_names,
                is_compound: is_compound,
                field_sets: field_sets,
            }
        )
        .map_err(CacheError::internal)
    }
}

/// A registered entity type: its fields, its primary key and the descriptors normalized against it.
#[fx_plus(child(CacheSystem), parent, rc, no_new, default(off))]
pub struct EntityType {
    #[fieldx(get(vis(pub), copy))]
    id: usize,

    #[fieldx(get(vis(pub)))]
    name: String,

    #[fieldx(get(vis(pub)))]
    fields: Vec<FieldDef>,

    index: HashMap<String, usize>,

    #[fieldx(get(vis(pub)))]
    pk_field_names: Vec<String>,

    #[fieldx(get(vis(pub), copy))]
    is_compound: bool,

    #[fieldx(get(vis(pub(crate))))]
    field_sets: FieldSetMemo,

    /// The cache for this type, created on first use.
    ///
    /// # Panics
    ///
    /// Panics if the [`CacheSystem`] the type was registered with has been dropped.
    #[fieldx(lazy, predicate, get(vis(pub), clone), builder(off))]
    cache: Rc<ViewModelCache>,
}

impl EntityType {
    pub fn declare(name: impl Into<String>) -> EntityDecl {
        EntityDecl {
            name:   name.into(),
            fields: Vec::new(),
            pk:     None,
        }
    }

    fn build_cache(&self) -> Rc<ViewModelCache> {
        match self.system().and_then(|system| ViewModelCache::new(self, &system)) {
            Ok(cache) => cache,
            Err(err) => panic!("{err}"),
        }
    }

    /// Drop every record cached for this type, leaving an empty cache behind.
    pub(crate) fn release_cache(&self) {
        if self.has_cache() {
            self.cache().release();
        }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Result<&FieldDef> {
        self.index
            .get(name)
            .map(|idx| &self.fields[*idx])
            .ok_or_else(|| CacheError::InvalidField {
                entity: self.name.clone(),
                field:  name.to_string(),
            })
    }

    pub fn relation(&self, name: &str) -> Result<&RelationField> {
        self.field(name)?.relation().ok_or_else(|| CacheError::NotARelation {
            entity: self.name.clone(),
            field:  name.to_string(),
        })
    }

    pub(crate) fn system(&self) -> Result<Rc<CacheSystem>> {
        self.parent()
            .ok_or_else(|| CacheError::internal(format!("cache system of {} is gone", self.name)))
    }

    /// Target type of relation field `name`.
    pub fn related(&self, name: &str) -> Result<Rc<EntityType>> {
        let rel = self.relation(name)?;
        self.system()?
            .entity(rel.to())
            .ok_or_else(|| CacheError::UnresolvedRelation {
                entity: self.name.clone(),
                field:  name.to_string(),
                target: rel.to().to_string(),
            })
    }

    /// Normalize a field request against this type.
    pub fn field_set(self: &Rc<Self>, paths: &[FieldPath]) -> Result<Arc<FieldSet>> {
        field_set::normalize(self, paths)
    }

    /// The descriptor holding only the non-relation fields of `fs`.
    pub fn shape_of(self: &Rc<Self>, fs: &FieldSet) -> Result<Arc<FieldSet>> {
        let paths = fs
            .fields()
            .iter()
            .map(|name| FieldPath::Scalar(name.clone()))
            .collect::<Vec<_>>();
        self.field_set(&paths)
    }

    /// Build a record from plain data.
    pub fn record(self: &Rc<Self>, data: &Value) -> Result<Record> {
        Record::from_data(self, data)
    }

    fn pk_error(&self, message: String) -> CacheError {
        CacheError::InvalidPrimaryKey {
            entity: self.name.clone(),
            message,
        }
    }

    fn pk_part(&self, name: &str, value: &Value) -> Value {
        match self.field(name).ok().and_then(FieldDef::scalar) {
            Some(field) => field.parse(value),
            None => value.clone(),
        }
    }

    /// Validate a primary key value and turn it into its cache key.
    pub fn pk_key(&self, value: &Value) -> Result<PkKey> {
        if self.is_compound {
            let Value::Object(parts) = value
            else {
                return Err(self.pk_error(format!(
                    "{} has a compound key of {}. You must provide an object mapping these fields to their values.",
                    self.name,
                    self.pk_field_names.join(", ")
                )));
            };
            let missing = self
                .pk_field_names
                .iter()
                .filter(|name| parts.get(name.as_str()).map_or(true, Value::is_null))
                .cloned()
                .collect::<Vec<_>>();
            if !missing.is_empty() {
                return Err(self.pk_error(format!(
                    "{} has a compound key of {}. Missing value(s) for field(s) {}",
                    self.name,
                    self.pk_field_names.join(", "),
                    missing.join(", ")
                )));
            }
            let mut names = self.pk_field_names.iter().collect::<Vec<_>>();
            names.sort();
            let key = names
                .into_iter()
                .map(|name| format!("{name}{KEY_SEPARATOR}{}", self.pk_part(name, &parts[name.as_str()])))
                .collect::<Vec<_>>()
                .join(KEY_SEPARATOR);
            Ok(PkKey(key))
        }
        else {
            let name = &self.pk_field_names[0];
            match value {
                Value::Object(_) | Value::Array(_) => Err(self.pk_error(format!(
                    "{} has a single primary key named '{}' but an object was provided. This should be a number or \
                     string.",
                    self.name, name
                ))),
                Value::Null => Err(self.pk_error("Primary key must be provided".to_string())),
                value => Ok(PkKey(self.pk_part(name, value).to_string())),
            }
        }
    }
}

impl Debug for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityType")
            .field("name", &self.name)
            .field("fields", &self.fields.iter().map(FieldDef::name).collect::<Vec<_>>())
            .field("pk", &self.pk_field_names)
            .field("field_sets", &self.field_sets)
            .finish()
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
