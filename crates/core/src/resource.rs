//! Resource node of the configuration tree.

use crate::address::PathElement;
use crate::value::ModelValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A node in the configuration tree.
///
/// Children are shared through `Arc` so that snapshots and transaction
/// overlays copy only the path they modify.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    /// Attribute values
    #[serde(default)]
    model: BTreeMap<String, ModelValue>,

    /// Children, grouped by child type then child name, in insertion order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    children: IndexMap<String, IndexMap<String, Arc<Resource>>>,
}

impl Resource {
    /// Create an empty resource.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a resource with the given attributes.
    pub fn with_model(model: BTreeMap<String, ModelValue>) -> Self {
        Self {
            model,
            children: IndexMap::new(),
        }
    }

    /// Attribute values.
    pub fn model(&self) -> &BTreeMap<String, ModelValue> {
        &self.model
    }

    /// Mutable attribute values.
    pub fn model_mut(&mut self) -> &mut BTreeMap<String, ModelValue> {
        &mut self.model
    }

    /// One attribute; undefined when absent.
    pub fn attribute(&self, name: &str) -> ModelValue {
        self.model.get(name).cloned().unwrap_or_default()
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<ModelValue>) -> ModelValue {
        self.model
            .insert(name.into(), value.into())
            .unwrap_or_default()
    }

    /// Whether any child exists.
    pub fn has_children(&self) -> bool {
        self.children.values().any(|named| !named.is_empty())
    }

    /// Child types present.
    pub fn child_types(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Children of one type, in insertion order.
    pub fn children(&self, child_type: &str) -> impl Iterator<Item = (&str, &Resource)> {
        self.children
            .get(child_type)
            .into_iter()
            .flat_map(|named| named.iter().map(|(name, child)| (name.as_str(), child.as_ref())))
    }

    /// Look up one child.
    pub fn child(&self, element: &PathElement) -> Option<&Resource> {
        self.children
            .get(&element.key)
            .and_then(|named| named.get(&element.value))
            .map(Arc::as_ref)
    }

    /// Shared handle to one child.
    pub fn child_arc(&self, element: &PathElement) -> Option<Arc<Resource>> {
        self.children
            .get(&element.key)
            .and_then(|named| named.get(&element.value))
            .cloned()
    }

    /// Mutable access to one child, copying it if shared.
    pub fn child_mut(&mut self, element: &PathElement) -> Option<&mut Resource> {
        self.children
            .get_mut(&element.key)
            .and_then(|named| named.get_mut(&element.value))
            .map(Arc::make_mut)
    }

    /// Insert or replace a child, returning the previous one.
    pub fn put_child(&mut self, element: &PathElement, child: Arc<Resource>) -> Option<Arc<Resource>> {
        self.children
            .entry(element.key.clone())
            .or_default()
            .insert(element.value.clone(), child)
    }

    /// Remove a child, dropping its type group when it becomes empty.
    pub fn remove_child(&mut self, element: &PathElement) -> Option<Arc<Resource>> {
        let named = self.children.get_mut(&element.key)?;
        let removed = named.shift_remove(&element.value);
        if named.is_empty() {
            self.children.shift_remove(&element.key);
        }
        removed
    }

    /// Walk down `path`.
    pub fn descendant(&self, path: &[PathElement]) -> Option<&Resource> {
        path.iter().try_fold(self, |node, element| node.child(element))
    }

    /// Walk down `path` for update, copying shared nodes along the way.
    pub fn descendant_mut(&mut self, path: &[PathElement]) -> Option<&mut Resource> {
        let mut node = self;
        for element in path {
            node = node.child_mut(element)?;
        }
        Some(node)
    }

    /// Render as a value: attributes plus children grouped by type.
    ///
    /// Without `recursive`, children are listed by name with undefined values.
    pub fn to_value(&self, recursive: bool) -> ModelValue {
        let mut fields: BTreeMap<String, ModelValue> = self.model.clone();
        for (child_type, named) in &self.children {
            let entries = named
                .iter()
                .map(|(name, child)| {
                    let value = if recursive {
                        child.to_value(true)
                    } else {
                        ModelValue::Undefined
                    };
                    (name.clone(), value)
                })
                .collect::<BTreeMap<_, _>>();
            fields.insert(child_type.clone(), ModelValue::Object(entries));
        }
        ModelValue::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(key: &str, value: &str) -> PathElement {
        PathElement::new(key, value)
    }

    #[test]
    fn test_children_keep_insertion_order() {
        let mut root = Resource::new();
        root.put_child(&element("child", "two"), Arc::new(Resource::new()));
        root.put_child(&element("child", "one"), Arc::new(Resource::new()));

        let names: Vec<_> = root.children("child").map(|(name, _)| name).collect();
        assert_eq!(names, vec!["two", "one"]);
    }

    #[test]
    fn test_copy_on_write_leaves_original() {
        let mut child = Resource::new();
        child.set_attribute("attribute1", 1);
        let mut root = Resource::new();
        root.put_child(&element("child", "one"), Arc::new(child));

        let snapshot = root.clone();
        root.descendant_mut(&[element("child", "one")])
            .unwrap()
            .set_attribute("attribute1", 5);

        let path = [element("child", "one")];
        assert_eq!(snapshot.descendant(&path).unwrap().attribute("attribute1"), 1.into());
        assert_eq!(root.descendant(&path).unwrap().attribute("attribute1"), 5.into());
    }

    #[test]
    fn test_remove_drops_empty_group() {
        let mut root = Resource::new();
        let before = root.clone();
        root.put_child(&element("child", "one"), Arc::new(Resource::new()));
        assert!(root.has_children());
        root.remove_child(&element("child", "one"));
        assert_eq!(root, before);
    }

    #[test]
    fn test_to_value() {
        let mut root = Resource::new();
        root.set_attribute("attr1", 1);
        let mut child = Resource::new();
        child.set_attribute("attribute1", 1);
        root.put_child(&element("child", "one"), Arc::new(child));

        let flat = root.to_value(false);
        assert_eq!(flat.get("attr1"), Some(&ModelValue::Int(1)));
        assert_eq!(flat.get("child").unwrap().get("one"), Some(&ModelValue::Undefined));

        let deep = root.to_value(true);
        let one = deep.get("child").unwrap().get("one").unwrap();
        assert_eq!(one.get("attribute1"), Some(&ModelValue::Int(1)));
    }
}
