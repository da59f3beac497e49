use std::fmt::Display;

/// A requested field, possibly traversing relations.
///
/// The string notation accepted by [`FieldPath::parse`] is the one used throughout the crate: a bare name for an own
/// field, a dotted path for relation traversal (`"group.owner.name"`) and `"*"` for everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldPath {
    Scalar(String),
    Relation(String, Vec<FieldPath>),
    Wildcard,
}

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        if path == "*" {
            return Self::Wildcard;
        }
        match path.split_once('.') {
            Some((head, rest)) => Self::Relation(head.to_string(), vec![Self::parse(rest)]),
            None => Self::Scalar(path.to_string()),
        }
    }

    /// Build a path from its segments, e.g. `["group", "owner", "name"]`.
    pub fn path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let segments = segments
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>();
        Self::from_segments(&segments)
    }

    fn from_segments(segments: &[String]) -> Self {
        match segments {
            [] => Self::Wildcard,
            [last] if last == "*" => Self::Wildcard,
            [last] => Self::Scalar(last.clone()),
            [head, rest @ ..] => Self::Relation(head.clone(), vec![Self::from_segments(rest)]),
        }
    }

    pub fn list<I, S>(items: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        items.into_iter().map(|s| Self::parse(s.as_ref())).collect()
    }

    pub fn all() -> Vec<Self> {
        vec![Self::Wildcard]
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Scalar(name) | Self::Relation(name, _) => Some(name),
            Self::Wildcard => None,
        }
    }
}

impl From<&str> for FieldPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<String> for FieldPath {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scalar(name) => write!(f, "{name}"),
            Self::Wildcard => write!(f, "*"),
            Self::Relation(name, nested) if nested.len() == 1 => write!(f, "{name}.{}", nested[0]),
            Self::Relation(name, nested) => {
                write!(f, "{name}.{{")?;
                for (idx, path) in nested.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{path}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dotted_paths() {
        assert_eq!(FieldPath::parse("name"), FieldPath::Scalar("name".into()));
        assert_eq!(FieldPath::parse("*"), FieldPath::Wildcard);
        assert_eq!(
            FieldPath::parse("group.owner.name"),
            FieldPath::Relation(
                "group".into(),
                vec![FieldPath::Relation("owner".into(), vec![FieldPath::Scalar("name".into())])]
            )
        );
        assert_eq!(FieldPath::parse("group.owner.name"), FieldPath::path(["group", "owner", "name"]));
        assert_eq!(
            FieldPath::parse("group.*"),
            FieldPath::Relation("group".into(), vec![FieldPath::Wildcard])
        );
    }

    #[test]
    fn displays_back_to_dotted_form() {
        assert_eq!(FieldPath::parse("group.owner.name").to_string(), "group.owner.name");
        let grouped = FieldPath::Relation(
            "group".into(),
            vec![FieldPath::Scalar("id".into()), FieldPath::Scalar("name".into())],
        );
        assert_eq!(grouped.to_string(), "group.{id,name}");
    }
}
