//! Resource addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One `(type, name)` segment of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "(String, String)", into = "(String, String)")]
pub struct PathElement {
    /// Child type, e.g. `subsystem`
    pub key: String,
    /// Child name, e.g. `logging`
    pub value: String,
}

impl PathElement {
    /// Create a path element.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl From<(String, String)> for PathElement {
    fn from((key, value): (String, String)) -> Self {
        Self { key, value }
    }
}

impl From<PathElement> for (String, String) {
    fn from(element: PathElement) -> Self {
        (element.key, element.value)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Ordered sequence of path elements identifying a resource.
///
/// The empty address is the root. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(Vec<PathElement>);

impl Address {
    /// The root address.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build an address from `(type, name)` pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(pairs.into_iter().map(|(k, v)| PathElement::new(k, v)).collect())
    }

    /// Return a new address with one more element.
    pub fn append(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::new(key, value));
        Self(elements)
    }

    /// Return a new address with all elements of `other` appended.
    pub fn join(&self, other: &Address) -> Self {
        let mut elements = self.0.clone();
        elements.extend(other.0.iter().cloned());
        Self(elements)
    }

    /// Whether this is the root address.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the address has no elements.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The address elements.
    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    /// Last element, if any.
    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    /// Parent address. The root has no parent.
    pub fn parent(&self) -> Option<Address> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Whether `self` is equal to or an ancestor of `other`.
    pub fn is_prefix_of(&self, other: &Address) -> bool {
        self.0.len() <= other.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// Whether two addresses are equal or in an ancestor/descendant relation.
    pub fn overlaps(&self, other: &Address) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }

    /// Elements of `self` below `ancestor`, if `ancestor` is a prefix.
    pub fn relative_to(&self, ancestor: &Address) -> Option<&[PathElement]> {
        if ancestor.is_prefix_of(self) {
            Some(&self.0[ancestor.0.len()..])
        } else {
            None
        }
    }

    /// Parse the `/type=name/type=name` form used in logs and the CLI.
    pub fn parse(s: &str) -> Result<Self, AddressParseError> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::root());
        }

        let mut elements = Vec::new();
        for segment in trimmed.trim_start_matches('/').split('/') {
            let (key, value) = segment
                .split_once('=')
                .ok_or_else(|| AddressParseError(segment.to_string()))?;
            if key.is_empty() || value.is_empty() {
                return Err(AddressParseError(segment.to_string()));
            }
            elements.push(PathElement::new(key, value));
        }
        Ok(Self(elements))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for element in &self.0 {
            write!(f, "/{}", element)?;
        }
        Ok(())
    }
}

impl From<Vec<PathElement>> for Address {
    fn from(elements: Vec<PathElement>) -> Self {
        Self(elements)
    }
}

/// Malformed address segment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address segment '{0}', expected type=name")]
pub struct AddressParseError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        let root = Address::root();
        let a = Address::from_pairs([("subsystem", "a")]);
        let a_child = a.append("child", "one");
        let b = Address::from_pairs([("subsystem", "b")]);

        assert!(root.overlaps(&a));
        assert!(a.overlaps(&a_child));
        assert!(a_child.overlaps(&a));
        assert!(a.overlaps(&a));
        assert!(!a.overlaps(&b));
        assert!(!a_child.overlaps(&b));
    }

    #[test]
    fn test_parse_and_display() {
        let addr = Address::parse("/subsystem=logging/handler=console").unwrap();
        assert_eq!(addr.len(), 2);
        assert_eq!(addr.to_string(), "/subsystem=logging/handler=console");
        assert_eq!(Address::parse("/").unwrap(), Address::root());
        assert!(Address::parse("/subsystem").is_err());
    }

    #[test]
    fn test_serializes_as_pairs() {
        let addr = Address::from_pairs([("child", "one")]);
        assert_eq!(serde_json::to_string(&addr).unwrap(), r#"[["child","one"]]"#);
        let back: Address = serde_json::from_str(r#"[["child","one"]]"#).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_parent_and_relative() {
        let addr = Address::from_pairs([("a", "1"), ("b", "2")]);
        let parent = addr.parent().unwrap();
        assert_eq!(parent, Address::from_pairs([("a", "1")]));
        assert_eq!(addr.relative_to(&parent).unwrap(), &[PathElement::new("b", "2")]);
        assert!(Address::root().parent().is_none());
    }
}
