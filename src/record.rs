use crate::{
    entity::EntityType,
    error::{CacheError, Result},
    field::{FieldDef, FieldKind},
    field_path::FieldPath,
    field_set::FieldSet,
    types::PkKey,
};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::{cell::OnceCell, collections::{BTreeMap, BTreeSet}, fmt::Debug, rc::Rc, sync::Arc};
use tracing::warn;

/// Value of one assigned field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Scalar(Value),
    One(Option<Record>),
    Many(Vec<Record>),
}

/// A field definition together with the value a record holds for it.
#[derive(Debug, Clone)]
pub struct BoundField {
    pub field: FieldDef,
    pub value: FieldValue,
}

struct RecordInner {
    entity:    Rc<EntityType>,
    data:      BTreeMap<String, FieldValue>,
    assigned:  Vec<String>,
    pk_key:    PkKey,
    field_set: OnceCell<Arc<FieldSet>>,
}

/// An immutable snapshot of an entity with some subset of its fields.
///
/// Records are cheap to clone; clones share the data. [`PartialEq`] compares values, [`Record::ptr_eq`] compares
/// identity.
#[derive(Clone)]
pub struct Record(Rc<RecordInner>);

impl Record {
    pub(crate) fn from_data(entity: &Rc<EntityType>, data: &Value) -> Result<Self> {
        let Value::Object(input) = data
        else {
            return Err(CacheError::InvalidData {
                entity:  entity.name().to_string(),
                message: format!("expected an object, got {data}"),
            });
        };

        let null_pk = entity
            .pk_field_names()
            .iter()
            .filter(|name| input.get(name.as_str()).is_some_and(Value::is_null))
            .cloned()
            .collect::<Vec<_>>();
        if !null_pk.is_empty() {
            return Err(CacheError::NullPrimaryKey {
                entity: entity.name().to_string(),
                fields: null_pk,
            });
        }
        let missing_pk = entity
            .pk_field_names()
            .iter()
            .filter(|name| !input.contains_key(name.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        if !missing_pk.is_empty() {
            return Err(CacheError::MissingPrimaryKey {
                entity: entity.name().to_string(),
                fields: missing_pk,
            });
        }

        let warn_unknown = entity.system()?.config().warn_unknown_fields();
        let mut values = BTreeMap::new();
        let mut relations = Vec::new();

        for (name, value) in input {
            if !entity.has_field(name) {
                if warn_unknown {
                    warn!(
                        "Received value for key {} on {}. {} is not a field on {}; this value will be ignored.",
                        name,
                        entity.name(),
                        name,
                        entity.name()
                    );
                }
                continue;
            }
            let def = entity.field(name)?;
            match def.kind() {
                FieldKind::Scalar(field) => {
                    let normalized = field.normalize(value).map_err(|message| CacheError::FieldValue {
                        entity: entity.name().to_string(),
                        field: name.clone(),
                        message,
                    })?;
                    values.insert(name.clone(), FieldValue::Scalar(normalized));
                }
                FieldKind::Relation(_) => relations.push((def, value)),
            }
        }

        // Relation data wins over a separately supplied source field.
        for (def, value) in relations {
            let Some(rel) = def.relation()
            else {
                continue;
            };
            let target = entity.related(def.name())?;
            let bad_value = |what: &str| CacheError::InvalidData {
                entity:  entity.name().to_string(),
                message: format!("relation '{}' expects {what}, got {value}", def.name()),
            };
            let (related, source) = if rel.many() {
                match value {
                    Value::Null => (FieldValue::Many(Vec::new()), Value::Null),
                    Value::Array(items) => {
                        let records = items
                            .iter()
                            .map(|item| Record::from_data(&target, item))
                            .collect::<Result<Vec<_>>>()?;
                        let ids = records.iter().map(Record::pk).collect::<Vec<_>>();
                        (FieldValue::Many(records), Value::Array(ids))
                    }
                    _ => return Err(bad_value("a list of objects")),
                }
            }
            else {
                match value {
                    Value::Null => (FieldValue::One(None), Value::Null),
                    Value::Object(_) => {
                        let record = Record::from_data(&target, value)?;
                        let id = record.pk();
                        (FieldValue::One(Some(record)), id)
                    }
                    _ => return Err(bad_value("an object")),
                }
            };

            let source_name = rel.source_field_name();
            if let Some(FieldValue::Scalar(given)) = values.get(source_name) {
                if *given != source {
                    warn!(
                        "{}.{} was given as {} but {}.{} holds {}; using the relation value",
                        entity.name(),
                        source_name,
                        given,
                        entity.name(),
                        def.name(),
                        source
                    );
                }
            }
            values.insert(source_name.to_string(), FieldValue::Scalar(source));
            values.insert(def.name().to_string(), related);
        }

        Self::from_parts(entity.clone(), values)
    }

    pub(crate) fn from_parts(entity: Rc<EntityType>, data: BTreeMap<String, FieldValue>) -> Result<Self> {
        let pk_value = pk_value_of(&entity, &data);
        let pk_key = entity.pk_key(&pk_value)?;
        Ok(Self(Rc::new(RecordInner {
            assigned: data.keys().cloned().collect(),
            entity,
            data,
            pk_key,
            field_set: OnceCell::new(),
        })))
    }

    pub fn entity(&self) -> &Rc<EntityType> {
        &self.0.entity
    }

    /// Names of the fields set on this record, sorted. Relation names and their source fields are included.
    pub fn assigned_fields(&self) -> &[String] {
        &self.0.assigned
    }

    /// Assigned fields with related records' fields flattened as dotted paths.
    pub fn assigned_fields_deep(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (name, value) in &self.0.data {
            let nested = match value {
                FieldValue::One(Some(record)) => record.assigned_fields_deep(),
                FieldValue::Many(records) if !records.is_empty() => common_deep_fields(records),
                _ => {
                    out.push(name.clone());
                    continue;
                }
            };
            out.extend(nested.into_iter().map(|path| format!("{name}.{path}")));
        }
        out.sort();
        out
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.data.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.0.data.get(name)
    }

    /// Assigned fields and their values, in field name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> + '_ {
        self.0.data.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Scalar value of field `name`.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.0.data.get(name) {
            Some(FieldValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    /// Related record of single relation `name`; `None` when unset or null.
    pub fn related(&self, name: &str) -> Option<&Record> {
        match self.0.data.get(name) {
            Some(FieldValue::One(record)) => record.as_ref(),
            _ => None,
        }
    }

    pub fn related_many(&self, name: &str) -> Option<&[Record]> {
        match self.0.data.get(name) {
            Some(FieldValue::Many(records)) => Some(records),
            _ => None,
        }
    }

    /// The primary key as given in data: the bare value, or an object for compound keys.
    pub fn pk(&self) -> Value {
        pk_value_of(&self.0.entity, &self.0.data)
    }

    pub fn pk_key(&self) -> &PkKey {
        &self.0.pk_key
    }

    pub fn ptr_eq(&self, other: &Record) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Value equality: same type, same assigned fields and equal values per field kind, recursing into relations.
    pub fn is_equal(&self, other: &Record) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if !Rc::ptr_eq(&self.0.entity, &other.0.entity) || self.0.assigned != other.0.assigned {
            return false;
        }
        self.0.data.iter().all(|(name, value)| {
            let Some(other_value) = other.0.data.get(name)
            else {
                return false;
            };
            match (value, other_value) {
                (FieldValue::Scalar(a), FieldValue::Scalar(b)) => {
                    match self.0.entity.field(name).ok().and_then(FieldDef::scalar) {
                        Some(field) => field.is_equal(a, b),
                        None => a == b,
                    }
                }
                (FieldValue::One(a), FieldValue::One(b)) => match (a, b) {
                    (None, None) => true,
                    (Some(a), Some(b)) => a.is_equal(b),
                    _ => false,
                },
                (FieldValue::Many(a), FieldValue::Many(b)) => {
                    a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.is_equal(b))
                }
                _ => false,
            }
        })
    }

    /// Whether this record holds every field of `fs`. A null relation covers any nested set.
    pub fn covers(&self, fs: &FieldSet) -> bool {
        fs.fields().iter().all(|name| self.has(name))
            && fs.relations().iter().all(|(name, nested)| match self.get(name) {
                Some(FieldValue::One(None)) => true,
                Some(FieldValue::One(Some(record))) => record.covers(nested),
                Some(FieldValue::Many(records)) => records.iter().all(|record| record.covers(nested)),
                _ => false,
            })
    }

    /// A new record holding exactly the fields of `fs`.
    pub fn clone_fields(&self, fs: &FieldSet) -> Result<Record> {
        let mut missing = Vec::new();
        let mut data = BTreeMap::new();

        for name in fs.fields() {
            match self.get(name) {
                Some(value) => {
                    data.insert(name.clone(), value.clone());
                }
                None => missing.push(name.clone()),
            }
        }

        for (name, nested) in fs.relations() {
            let prefix_missing = |err: CacheError| match err {
                CacheError::MissingFields { entity, missing } => CacheError::MissingFields {
                    entity,
                    missing: missing.into_iter().map(|m| format!("{name}.{m}")).collect(),
                },
                err => err,
            };
            let value = match self.get(name) {
                Some(FieldValue::One(None)) => FieldValue::One(None),
                Some(FieldValue::One(Some(record))) => {
                    FieldValue::One(Some(record.clone_fields(nested).map_err(prefix_missing)?))
                }
                Some(FieldValue::Many(records)) => FieldValue::Many(
                    records
                        .iter()
                        .map(|record| record.clone_fields(nested))
                        .collect::<Result<Vec<_>>>()
                        .map_err(prefix_missing)?,
                ),
                _ => {
                    missing.push(name.clone());
                    continue;
                }
            };
            data.insert(name.clone(), value);
        }

        if !missing.is_empty() {
            return Err(CacheError::MissingFields {
                entity: self.0.entity.name().to_string(),
                missing,
            });
        }
        Record::from_parts(self.0.entity.clone(), data)
    }

    /// A copy of this record with the given relation values set.
    pub(crate) fn with_relations(&self, relations: Vec<(String, FieldValue)>) -> Result<Record> {
        let mut data = self.0.data.clone();
        data.extend(relations);
        Record::from_parts(self.0.entity.clone(), data)
    }

    /// The descriptor of exactly what this record holds.
    ///
    /// A null relation stands for its target's primary key only. Records in a many relation may hold different
    /// fields, then only the fields all of them share count.
    pub fn field_set(&self) -> Result<Arc<FieldSet>> {
        if let Some(fs) = self.0.field_set.get() {
            return Ok(fs.clone());
        }
        let fs = self.0.entity.field_set(&self.request_paths()?)?;
        let _ = self.0.field_set.set(fs.clone());
        Ok(fs)
    }

    fn request_paths(&self) -> Result<Vec<FieldPath>> {
        let mut paths = Vec::with_capacity(self.0.data.len());
        for (name, value) in &self.0.data {
            let path = match value {
                FieldValue::Scalar(_) => FieldPath::Scalar(name.clone()),
                FieldValue::One(None) => FieldPath::Relation(name.clone(), Vec::new()),
                FieldValue::One(Some(record)) => FieldPath::Relation(name.clone(), record.request_paths()?),
                FieldValue::Many(records) => FieldPath::Relation(name.clone(), common_request_paths(records)?),
            };
            paths.push(path);
        }
        Ok(paths)
    }

    /// Plain data form, with relations nested.
    pub fn to_js(&self) -> Value {
        let mut out = Map::new();
        for (name, value) in &self.0.data {
            let js = match value {
                FieldValue::Scalar(value) => match self.0.entity.field(name).ok().and_then(FieldDef::scalar) {
                    Some(field) => field.to_js(value),
                    None => value.clone(),
                },
                FieldValue::One(None) => Value::Null,
                FieldValue::One(Some(record)) => record.to_js(),
                FieldValue::Many(records) => Value::Array(records.iter().map(Record::to_js).collect()),
            };
            out.insert(name.clone(), js);
        }
        Value::Object(out)
    }

    /// Every assigned field with its definition.
    pub fn bound_fields(&self) -> BTreeMap<String, BoundField> {
        self.0
            .data
            .iter()
            .filter_map(|(name, value)| {
                let field = self.0.entity.field(name).ok()?.clone();
                Some((
                    name.clone(),
                    BoundField {
                        field,
                        value: value.clone(),
                    },
                ))
            })
            .collect()
    }
}

fn pk_value_of(entity: &EntityType, data: &BTreeMap<String, FieldValue>) -> Value {
    let scalar = |name: &str| match data.get(name) {
        Some(FieldValue::Scalar(value)) => value.clone(),
        _ => Value::Null,
    };
    if entity.is_compound() {
        Value::Object(
            entity
                .pk_field_names()
                .iter()
                .map(|name| (name.clone(), scalar(name)))
                .collect(),
        )
    }
    else {
        scalar(&entity.pk_field_names()[0])
    }
}

fn common_request_paths(records: &[Record]) -> Result<Vec<FieldPath>> {
    let Some(first) = records.first()
    else {
        return Ok(Vec::new());
    };
    let first_fs = first.field_set()?;
    let mut common = first_fs.paths().iter().cloned().collect::<BTreeSet<_>>();
    for record in &records[1..] {
        let fs = record.field_set()?;
        if !Arc::ptr_eq(&fs, &first_fs) {
            common.retain(|path| fs.contains(path));
        }
    }
    Ok(common.iter().map(|path| FieldPath::parse(path)).collect())
}

fn common_deep_fields(records: &[Record]) -> Vec<String> {
    let mut iter = records.iter();
    let Some(first) = iter.next()
    else {
        return Vec::new();
    };
    let mut common = first.assigned_fields_deep().into_iter().collect::<BTreeSet<_>>();
    for record in iter {
        let fields = record.assigned_fields_deep().into_iter().collect::<BTreeSet<_>>();
        common.retain(|path| fields.contains(path));
    }
    common.into_iter().collect()
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.0.entity.name(), self.to_js())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_js().serialize(serializer)
    }
}
