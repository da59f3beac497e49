use crate::{field_path::FieldPath, record::Record};
use serde_json::Value;
use std::{
    fmt::{Debug, Display},
    rc::Rc,
};

/// Separator used when joining names and values into string keys.
pub(crate) const KEY_SEPARATOR: &str = "⁞";

pub type ChangeListener = Rc<dyn Fn(Option<Record>, Option<Record>)>;
pub type MultiChangeListener = Rc<dyn Fn(Vec<Option<Record>>, Vec<Option<Record>>)>;
pub type AnyChangeListener = Rc<dyn Fn()>;

/// Canonical cache key of a primary key value. Compound keys are order independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkKey(pub(crate) String);

impl PkKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What to look a record up by: a raw primary key value or an existing record.
///
/// A compound key is given as a JSON object mapping every key field to its value.
#[derive(Debug, Clone)]
pub enum LookupKey {
    Pk(Value),
    Record(Record),
}

impl From<Value> for LookupKey {
    fn from(value: Value) -> Self {
        Self::Pk(value)
    }
}

impl From<&Value> for LookupKey {
    fn from(value: &Value) -> Self {
        Self::Pk(value.clone())
    }
}

impl From<i64> for LookupKey {
    fn from(value: i64) -> Self {
        Self::Pk(Value::from(value))
    }
}

impl From<i32> for LookupKey {
    fn from(value: i32) -> Self {
        Self::Pk(Value::from(value))
    }
}

impl From<u64> for LookupKey {
    fn from(value: u64) -> Self {
        Self::Pk(Value::from(value))
    }
}

impl From<&str> for LookupKey {
    fn from(value: &str) -> Self {
        Self::Pk(Value::from(value))
    }
}

impl From<String> for LookupKey {
    fn from(value: String) -> Self {
        Self::Pk(Value::from(value))
    }
}

impl From<Record> for LookupKey {
    fn from(value: Record) -> Self {
        Self::Record(value)
    }
}

impl From<&Record> for LookupKey {
    fn from(value: &Record) -> Self {
        Self::Record(value.clone())
    }
}

/// Input accepted by [`ViewModelCache::add`](crate::cache::ViewModelCache::add).
#[derive(Debug, Clone)]
pub enum RecordInput {
    Data(Value),
    Record(Record),
}

impl From<Value> for RecordInput {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<Record> for RecordInput {
    fn from(value: Record) -> Self {
        Self::Record(value)
    }
}

impl From<&Record> for RecordInput {
    fn from(value: &Record) -> Self {
        Self::Record(value.clone())
    }
}

/// The three shapes of change subscription.
pub enum Listen {
    /// Called with no arguments, at most once per outermost operation, whenever anything in the cache changed.
    AnyChange(AnyChangeListener),
    /// Called with `(previous, next)` whenever the value for one key and field set changes.
    Record {
        key:      LookupKey,
        fields:   Vec<FieldPath>,
        listener: ChangeListener,
    },
    /// Called with the previous and next values of every listed key, once per outermost operation.
    Records {
        keys:     Vec<LookupKey>,
        fields:   Vec<FieldPath>,
        listener: MultiChangeListener,
    },
}

impl Listen {
    pub fn any_change(listener: impl Fn() + 'static) -> Self {
        Self::AnyChange(Rc::new(listener))
    }

    pub fn record(
        key: impl Into<LookupKey>,
        fields: Vec<FieldPath>,
        listener: impl Fn(Option<Record>, Option<Record>) + 'static,
    ) -> Self {
        Self::Record {
            key: key.into(),
            fields,
            listener: Rc::new(listener),
        }
    }

    pub fn records<I, K>(
        keys: I,
        fields: Vec<FieldPath>,
        listener: impl Fn(Vec<Option<Record>>, Vec<Option<Record>>) + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<LookupKey>,
    {
        Self::Records {
            keys: keys.into_iter().map(Into::into).collect(),
            fields,
            listener: Rc::new(listener),
        }
    }
}

impl Debug for Listen {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AnyChange(_) => fmt.debug_tuple("Listen::AnyChange").finish(),
            Self::Record { key, fields, .. } => fmt
                .debug_struct("Listen::Record")
                .field("key", key)
                .field("fields", fields)
                .finish(),
            Self::Records { keys, fields, .. } => fmt
                .debug_struct("Listen::Records")
                .field("keys", keys)
                .field("fields", fields)
                .finish(),
        }
    }
}

/// Removes a listener. Dropping it without calling [`unsubscribe`](Unsubscribe::unsubscribe) keeps the listener
/// registered.
#[must_use = "dropping an Unsubscribe leaves the listener registered forever"]
pub struct Unsubscribe(Option<Box<dyn FnOnce()>>);

impl Unsubscribe {
    pub(crate) fn new(f: impl FnOnce() + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub(crate) fn combine(all: Vec<Unsubscribe>) -> Self {
        Self::new(move || {
            for unsubscribe in all {
                unsubscribe.unsubscribe();
            }
        })
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Debug for Unsubscribe {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_tuple("Unsubscribe")
            .field(&if self.0.is_some() { "active" } else { "spent" })
            .finish()
    }
}
