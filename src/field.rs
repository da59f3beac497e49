use crate::traits::Field;
use serde_json::Value;
use std::{fmt::Debug, rc::Rc};

/// A relation to another entity type.
///
/// The target is referenced by name and looked up in the registry when the relation is first used, which lets two
/// types point at each other regardless of registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationField {
    pub(crate) to:                String,
    pub(crate) source_field_name: String,
    pub(crate) many:              bool,
}

impl RelationField {
    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn source_field_name(&self) -> &str {
        &self.source_field_name
    }

    pub fn many(&self) -> bool {
        self.many
    }
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(Rc<dyn Field>),
    Relation(RelationField),
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
}

impl FieldDef {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_relation(&self) -> bool {
        matches!(self.kind, FieldKind::Relation(_))
    }

    pub fn relation(&self) -> Option<&RelationField> {
        match &self.kind {
            FieldKind::Relation(rel) => Some(rel),
            FieldKind::Scalar(_) => None,
        }
    }

    pub fn scalar(&self) -> Option<&Rc<dyn Field>> {
        match &self.kind {
            FieldKind::Scalar(field) => Some(field),
            FieldKind::Relation(_) => None,
        }
    }
}

/// Accepts any JSON value as is.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyField;

impl Field for AnyField {
    fn kind(&self) -> &'static str {
        "AnyField"
    }

    fn normalize(&self, value: &Value) -> Result<Value, String> {
        Ok(value.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CharField;

impl Field for CharField {
    fn kind(&self) -> &'static str {
        "CharField"
    }

    fn normalize(&self, value: &Value) -> Result<Value, String> {
        match value {
            Value::Null | Value::String(_) => Ok(value.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("expected a string, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerField;

impl Field for IntegerField {
    fn kind(&self) -> &'static str {
        "IntegerField"
    }

    fn normalize(&self, value: &Value) -> Result<Value, String> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|err| format!("'{s}' is not an integer: {err}")),
            other => Err(format!("expected an integer, got {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BooleanField;

impl Field for BooleanField {
    fn kind(&self) -> &'static str {
        "BooleanField"
    }

    fn normalize(&self, value: &Value) -> Result<Value, String> {
        match value {
            Value::Null | Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" => Ok(Value::Bool(false)),
            other => Err(format!("expected a boolean, got {other}")),
        }
    }
}

/// A list of values of the wrapped field kind.
#[derive(Debug, Clone)]
pub struct ListField {
    inner: Rc<dyn Field>,
}

impl ListField {
    pub fn new(inner: impl Field) -> Self {
        Self { inner: Rc::new(inner) }
    }
}

impl Field for ListField {
    fn kind(&self) -> &'static str {
        "ListField"
    }

    fn normalize(&self, value: &Value) -> Result<Value, String> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Array(items) => items
                .iter()
                .map(|item| self.inner.normalize(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Err(format!("expected a list, got {other}")),
        }
    }

    fn is_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| self.inner.is_equal(a, b))
            }
            _ => a == b,
        }
    }

    fn to_js(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => Value::Array(items.iter().map(|item| self.inner.to_js(item)).collect()),
            other => other.clone(),
        }
    }

    fn is_list(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stock_fields_normalize() {
        assert_eq!(CharField.normalize(&json!(12)), Ok(json!("12")));
        assert_eq!(IntegerField.normalize(&json!(" 42 ")), Ok(json!(42)));
        assert!(IntegerField.normalize(&json!("forty-two")).is_err());
        assert_eq!(BooleanField.normalize(&json!("true")), Ok(json!(true)));
        assert_eq!(IntegerField.parse(&json!("nope")), json!("nope"));
    }

    #[test]
    fn list_field_normalizes_elements() {
        let field = ListField::new(IntegerField);
        assert_eq!(field.normalize(&json!(["1", 2])), Ok(json!([1, 2])));
        assert!(field.normalize(&json!(1)).is_err());
        assert!(field.is_equal(&json!([1, 2]), &json!([1, 2])));
        assert!(!field.is_equal(&json!([1, 2]), &json!([2, 1])));
    }
}
