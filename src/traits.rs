use serde_json::Value;
use std::fmt::Debug;

/// Value capability of a scalar field.
///
/// The cache never interprets values on its own: it only normalizes incoming data, compares values and converts them
/// back to plain JSON through this trait.
pub trait Field: Debug + 'static {
    /// Short name of the field kind; used in error messages.
    fn kind(&self) -> &'static str;

    /// Convert a raw value into the form stored on records. Errors are reported as plain messages, the caller knows
    /// which entity and field they belong to.
    fn normalize(&self, value: &Value) -> Result<Value, String>;

    /// Like [`normalize`](Field::normalize) but passes invalid input through unchanged.
    fn parse(&self, value: &Value) -> Value {
        self.normalize(value).unwrap_or_else(|_| value.clone())
    }

    fn is_equal(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    fn to_js(&self, value: &Value) -> Value {
        value.clone()
    }

    /// Whether values of this field are lists. Many-valued relations require their source field to be one.
    fn is_list(&self) -> bool {
        false
    }
}
