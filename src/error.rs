use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid field '{field}' on {entity}")]
    InvalidField { entity: String, field: String },

    #[error("Nested paths are only valid for relation fields. '{field}' on {entity} is not a relation.")]
    NotARelation { entity: String, field: String },

    #[error("Attempted to use a {got} record with the cache for {expected}")]
    WrongEntityType { expected: String, got: String },

    #[error("{entity}: {message}")]
    InvalidPrimaryKey { entity: String, message: String },

    #[error(
        "({entity}): Missing value(s) for primary key(s) '{}'. If this was constructed from data returned from an \
         endpoint ensure it is setup to return these field(s).",
        .fields.join("', '")
    )]
    MissingPrimaryKey { entity: String, fields: Vec<String> },

    #[error("({entity}): Primary key(s) '{}' was provided but was null", .fields.join("', '"))]
    NullPrimaryKey { entity: String, fields: Vec<String> },

    #[error("({entity}): {message}")]
    InvalidData { entity: String, message: String },

    #[error("Invalid value for {entity}.{field}: {message}")]
    FieldValue {
        entity:  String,
        field:   String,
        message: String,
    },

    #[error("Can't clone {entity}; missing fields: {}", .missing.join(", "))]
    MissingFields { entity: String, missing: Vec<String> },

    #[error("Relation {entity}.{field} points to '{target}' which is not registered")]
    UnresolvedRelation {
        entity: String,
        field:  String,
        target: String,
    },

    #[error("Entity type '{0}' is already registered")]
    DuplicateEntity(String),

    #[error("Schema error in {entity}: {message}")]
    Schema { entity: String, message: String },

    #[error("{0}. This is a bug.")]
    Internal(String),
}

impl CacheError {
    pub(crate) fn internal<S: ToString>(msg: S) -> Self {
        Self::Internal(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_missing_pk_messages_differ() {
        let missing = CacheError::MissingPrimaryKey {
            entity: "User".into(),
            fields: vec!["id".into()],
        };
        let null = CacheError::NullPrimaryKey {
            entity: "User".into(),
            fields: vec!["id".into()],
        };
        assert!(missing.to_string().contains("Missing value(s) for primary key(s) 'id'"));
        assert!(null.to_string().contains("'id' was provided but was null"));
    }

    #[test]
    fn internal_errors_are_marked_as_bugs() {
        assert_eq!(
            CacheError::internal("slot for key 'name' is missing").to_string(),
            "slot for key 'name' is missing. This is a bug."
        );
    }
}
