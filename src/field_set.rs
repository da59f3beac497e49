use crate::{
    entity::EntityType,
    error::{CacheError, Result},
    field::FieldKind,
    field_path::FieldPath,
    types::KEY_SEPARATOR,
};
use moka::sync::Cache;
use std::{cell::RefCell, collections::{BTreeMap, BTreeSet, HashMap}, fmt::{Debug, Display}, rc::Rc, sync::Arc};
use tracing::trace;

/// Canonical descriptor of a requested set of fields.
///
/// Two requests naming the same fields, in any order and in any notation, share one descriptor instance. Primary key
/// fields and relation source fields are always part of the set.
#[derive(PartialEq, Eq)]
pub struct FieldSet {
    entity:    String,
    key:       String,
    paths:     Vec<String>,
    fields:    Vec<String>,
    relations: Vec<(String, Arc<FieldSet>)>,
}

impl FieldSet {
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// The cache key: sorted flattened paths without the entity's own primary key fields.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Every flattened path of the set, nested primary keys included.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Own non-relation fields, sorted.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn relations(&self) -> &[(String, Arc<FieldSet>)] {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&Arc<FieldSet>> {
        self.relations
            .iter()
            .find_map(|(rel, nested)| (rel == name).then_some(nested))
    }

    pub fn has_relations(&self) -> bool {
        !self.relations.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.binary_search_by(|p| p.as_str().cmp(path)).is_ok()
    }

    pub fn is_subset_of(&self, other: &FieldSet) -> bool {
        self.paths.iter().all(|path| other.contains(path))
    }

    /// The descriptor as a list of requestable paths.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut out = self
            .fields
            .iter()
            .map(|name| FieldPath::Scalar(name.clone()))
            .collect::<Vec<_>>();
        for (name, nested) in &self.relations {
            out.push(FieldPath::Relation(name.clone(), nested.field_paths()));
        }
        out
    }
}

impl Debug for FieldSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FieldSet<{}>[{}]", self.entity, self.paths.join(", "))
    }
}

impl Display for FieldSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.paths.join(", "))
    }
}

/// Per-entity memo of normalized descriptors.
///
/// `requests` maps a rendering of the request as given to its descriptor and may evict; `canonical` maps descriptor
/// keys to the one shared instance.
pub(crate) struct FieldSetMemo {
    requests:  Cache<String, Arc<FieldSet>>,
    canonical: RefCell<HashMap<String, Arc<FieldSet>>>,
}

impl FieldSetMemo {
    pub(crate) fn new(name: &str, capacity: u64) -> Self {
        let mut builder = Cache::builder().name(name);
        if capacity > 0 {
            builder = builder.max_capacity(capacity);
        }
        Self {
            requests:  builder.build(),
            canonical: RefCell::new(HashMap::new()),
        }
    }

    fn canonicalize(&self, fs: FieldSet) -> Arc<FieldSet> {
        self.canonical
            .borrow_mut()
            .entry(fs.key.clone())
            .or_insert_with(|| Arc::new(fs))
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.canonical.borrow().len()
    }
}

impl Debug for FieldSetMemo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldSetMemo")
            .field("requests", &self.requests.entry_count())
            .field("canonical", &self.len())
            .finish()
    }
}

fn request_signature(paths: &[FieldPath]) -> String {
    paths
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

/// Normalize a request against an entity type and return the shared descriptor for it.
pub(crate) fn normalize(entity: &Rc<EntityType>, paths: &[FieldPath]) -> Result<Arc<FieldSet>> {
    let signature = request_signature(paths);
    if let Some(fs) = entity.field_sets().requests.get(&signature) {
        return Ok(fs);
    }

    let mut stack = vec![entity.id()];
    let fs = expand(entity, paths, &mut stack)?;
    trace!("[{}] normalized [{}] as [{}]", entity.name(), signature, fs);
    entity.field_sets().requests.insert(signature, fs.clone());
    Ok(fs)
}

/// Own non-relation fields of a type, as requestable paths. This is what a bare relation name expands to.
fn bare_paths(entity: &EntityType) -> Vec<FieldPath> {
    entity
        .fields()
        .iter()
        .filter(|def| !def.is_relation())
        .map(|def| FieldPath::Scalar(def.name().to_string()))
        .collect()
}

// `stack` holds ids of the types currently being expanded; a wildcard reaching one of them again stops at its scalar
// fields.
fn expand(entity: &Rc<EntityType>, paths: &[FieldPath], stack: &mut Vec<usize>) -> Result<Arc<FieldSet>> {
    let mut own = entity.pk_field_names().iter().cloned().collect::<BTreeSet<_>>();
    let mut nested: BTreeMap<String, Vec<FieldPath>> = BTreeMap::new();

    for path in paths {
        match path {
            FieldPath::Wildcard => {
                for def in entity.fields() {
                    match def.kind() {
                        FieldKind::Scalar(_) => {
                            own.insert(def.name().to_string());
                        }
                        FieldKind::Relation(rel) => {
                            own.insert(rel.source_field_name().to_string());
                            let target = entity.related(def.name())?;
                            let sub = if stack.contains(&target.id()) {
                                bare_paths(&target)
                            }
                            else {
                                vec![FieldPath::Wildcard]
                            };
                            nested.entry(def.name().to_string()).or_default().extend(sub);
                        }
                    }
                }
            }
            FieldPath::Scalar(name) => {
                let def = entity.field(name)?;
                match def.kind() {
                    FieldKind::Scalar(_) => {
                        own.insert(name.clone());
                    }
                    FieldKind::Relation(rel) => {
                        own.insert(rel.source_field_name().to_string());
                        let target = entity.related(name)?;
                        nested.entry(name.clone()).or_default().extend(bare_paths(&target));
                    }
                }
            }
            FieldPath::Relation(name, sub) => {
                let def = entity.field(name)?;
                let rel = def.relation().ok_or_else(|| CacheError::NotARelation {
                    entity: entity.name().to_string(),
                    field:  name.clone(),
                })?;
                own.insert(rel.source_field_name().to_string());
                nested.entry(name.clone()).or_default().extend(sub.iter().cloned());
            }
        }
    }

    let mut relations = Vec::with_capacity(nested.len());
    for (name, sub) in nested {
        let target = entity.related(&name)?;
        stack.push(target.id());
        let expanded = expand(&target, &sub, stack);
        stack.pop();
        relations.push((name, expanded?));
    }

    let mut paths = own.iter().cloned().collect::<Vec<_>>();
    for (name, nested) in &relations {
        paths.extend(nested.paths().iter().map(|p| format!("{name}.{p}")));
    }
    paths.sort();

    let pk = entity.pk_field_names();
    let key = paths
        .iter()
        .filter(|p| !pk.contains(p))
        .cloned()
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR);

    let fs = FieldSet {
        entity: entity.name().to_string(),
        key,
        paths,
        fields: own.into_iter().collect(),
        relations,
    };
    Ok(entity.field_sets().canonicalize(fs))
}
