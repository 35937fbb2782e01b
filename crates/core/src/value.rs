//! Typed attribute and parameter values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A typed value held by a resource attribute, an operation parameter or an
/// operation result.
///
/// Serializes to plain JSON; `Undefined` maps to `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelValue {
    /// Unset value
    #[default]
    Undefined,
    /// Boolean value
    Boolean(bool),
    /// Integer value
    Int(i64),
    /// String value
    String(String),
    /// Ordered list of values
    List(Vec<ModelValue>),
    /// Nested object, keyed by field name
    Object(BTreeMap<String, ModelValue>),
}

impl ModelValue {
    /// Create an empty object value.
    pub fn object() -> Self {
        Self::Object(BTreeMap::new())
    }

    /// Whether the value is set.
    pub fn is_defined(&self) -> bool {
        !matches!(self, Self::Undefined)
    }

    /// Integer view. Strings holding an integer are converted.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view. The strings `"true"` and `"false"` are converted.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            Self::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// List view.
    pub fn as_list(&self) -> Option<&[ModelValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Object view.
    pub fn as_object(&self) -> Option<&BTreeMap<String, ModelValue>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Look up a field of an object value.
    pub fn get(&self, key: &str) -> Option<&ModelValue> {
        self.as_object().and_then(|fields| fields.get(key))
    }

    /// Mutable access to a field, turning an undefined value into an object
    /// and inserting an undefined field when missing.
    ///
    /// Returns `None` when the value is defined but not an object.
    pub fn field_mut(&mut self, key: &str) -> Option<&mut ModelValue> {
        if !self.is_defined() {
            *self = Self::object();
        }
        match self {
            Self::Object(fields) => Some(fields.entry(key.to_string()).or_default()),
            _ => None,
        }
    }

    /// Append to a list value, turning an undefined value into a list.
    pub fn push(&mut self, value: impl Into<ModelValue>) {
        if !self.is_defined() {
            *self = Self::List(Vec::new());
        }
        if let Self::List(items) = self {
            items.push(value.into());
        }
    }
}

impl fmt::Display for ModelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

impl From<bool> for ModelValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for ModelValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for ModelValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<&str> for ModelValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ModelValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl<T: Into<ModelValue>> From<Vec<T>> for ModelValue {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, ModelValue>> for ModelValue {
    fn from(fields: BTreeMap<String, ModelValue>) -> Self {
        Self::Object(fields)
    }
}

impl<T: Into<ModelValue>> From<Option<T>> for ModelValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_shape() {
        let mut value = ModelValue::object();
        *value.field_mut("attr1").unwrap() = 1.into();
        *value.field_mut("name").unwrap() = "x".into();
        *value.field_mut("unset").unwrap() = ModelValue::Undefined;

        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"{"attr1":1,"name":"x","unset":null}"#);

        let back: ModelValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_nested_list_deserializes() {
        let value: ModelValue = serde_json::from_str(r#"[true, "a", [1, 2], {"k": null}]"#).unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items[0], ModelValue::Boolean(true));
        assert_eq!(items[2].as_list().unwrap().len(), 2);
        assert_eq!(items[3].get("k"), Some(&ModelValue::Undefined));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(ModelValue::from("42").as_int(), Some(42));
        assert_eq!(ModelValue::from("true").as_bool(), Some(true));
        assert_eq!(ModelValue::Undefined.as_int(), None);
        assert!(!ModelValue::from(None::<i64>).is_defined());
    }

    #[test]
    fn test_field_mut_rejects_scalars() {
        let mut value = ModelValue::from(3);
        assert!(value.field_mut("k").is_none());
    }
}
