//! Per-transaction private view of the resource tree.

use crate::trait_::{descend, ReadResource, Result, StorageError};
use crate::tree::{apply, Change, ResourceTree};
use confman_core::{Address, Resource};
use indexmap::IndexMap;
use std::sync::Arc;

/// Pending changes of one transaction layered over the base tree.
///
/// Changes are kept as whole replacement subtrees keyed by address. Keys
/// never overlap: writing below an already changed subtree edits that
/// subtree, and writing above one folds it into the new, larger subtree.
/// The base tree is only touched by [`ResourceTree::commit`].
pub struct Overlay {
    base: Arc<ResourceTree>,
    changes: IndexMap<Address, Option<Arc<Resource>>>,
}

impl Overlay {
    /// Open an empty overlay over `base`.
    pub fn new(base: Arc<ResourceTree>) -> Self {
        Self {
            base,
            changes: IndexMap::new(),
        }
    }

    /// The base tree.
    pub fn base(&self) -> &Arc<ResourceTree> {
        &self.base
    }

    /// Whether nothing was changed.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Addresses of changed subtrees.
    pub fn touched(&self) -> impl Iterator<Item = &Address> {
        self.changes.keys()
    }

    /// Mutable view of the resource at `address`.
    ///
    /// The caller must hold the address lock: the subtree is copied from the
    /// base tree on first use and later changes to the base below it would be
    /// lost on commit.
    pub fn for_update(&mut self, address: &Address) -> Result<&mut Resource> {
        if self.covering_key(address).is_none() {
            let current = self.read(address)?;
            self.changes.retain(|key, _| !address.is_prefix_of(key));
            self.changes.insert(address.clone(), Some(current));
        }
        self.covered_mut(address)
    }

    /// Create a resource. Fails if it exists or its parent does not.
    pub fn create(&mut self, address: &Address, resource: Resource) -> Result<&mut Resource> {
        let Some(parent) = address.parent() else {
            return Err(StorageError::AlreadyExists(address.clone()));
        };
        if self.exists(address) {
            return Err(StorageError::AlreadyExists(address.clone()));
        }
        if !self.exists(&parent) {
            return Err(StorageError::ParentMissing(address.clone()));
        }

        let resource = Arc::new(resource);
        if self.covering_key(&parent).is_some() {
            let last = address.last().cloned().ok_or_else(|| StorageError::AlreadyExists(address.clone()))?;
            self.covered_mut(&parent)?.put_child(&last, resource);
        } else {
            self.changes.retain(|key, _| !address.is_prefix_of(key));
            self.changes.insert(address.clone(), Some(resource));
        }
        self.covered_mut(address)
    }

    /// Remove a resource. Fails if it is missing or still has children.
    pub fn remove(&mut self, address: &Address) -> Result<Arc<Resource>> {
        self.remove_node(address, false)
    }

    /// Undo one recorded change to the node at `address`.
    ///
    /// `before` and `after` are the node as it was around the change. Only
    /// attributes still holding their `after` value are restored, so later
    /// changes to the same node survive. A created node is removed with its
    /// subtree and a removed one is put back.
    pub fn revert(&mut self, address: &Address, before: Option<&Resource>, after: Option<&Resource>) -> Result<()> {
        match (before, after) {
            (None, Some(_)) => {
                if self.exists(address) {
                    self.remove_node(address, true)?;
                }
            }
            (Some(before), None) => {
                if !self.exists(address) {
                    self.create(address, before.clone())?;
                }
            }
            (Some(before), Some(after)) => {
                let current = self.read(address)?;
                let restore: Vec<_> = before
                    .model()
                    .keys()
                    .chain(after.model().keys())
                    .filter_map(|name| {
                        let (old, new) = (before.attribute(name), after.attribute(name));
                        (old != new && current.attribute(name) == new).then(|| (name.clone(), old))
                    })
                    .collect();
                if !restore.is_empty() {
                    let node = self.for_update(address)?;
                    for (name, value) in restore {
                        if value.is_defined() {
                            node.set_attribute(name, value);
                        } else {
                            node.model_mut().remove(&name);
                        }
                    }
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn remove_node(&mut self, address: &Address, with_children: bool) -> Result<Arc<Resource>> {
        let Some(parent) = address.parent() else {
            return Err(StorageError::Other("the root resource cannot be removed".to_string()));
        };
        let existing = self.read(address)?;
        if existing.has_children() && !with_children {
            return Err(StorageError::HasChildren(address.clone()));
        }

        if self.covering_key(&parent).is_some() {
            let last = address.last().cloned().ok_or_else(|| StorageError::NotFound(address.clone()))?;
            self.covered_mut(&parent)?.remove_child(&last);
        } else {
            self.changes.retain(|key, _| !address.is_prefix_of(key));
            self.changes.insert(address.clone(), None);
        }
        Ok(existing)
    }

    /// Drain the pending changes for [`ResourceTree::commit`].
    pub fn into_changes(self) -> Vec<Change> {
        self.changes.into_iter().collect()
    }

    /// Drain the pending changes, leaving the overlay empty.
    pub fn take_changes(&mut self) -> Vec<Change> {
        std::mem::take(&mut self.changes).into_iter().collect()
    }

    /// Drop every pending change.
    pub fn discard(&mut self) {
        self.changes.clear();
    }

    /// Key of the changed subtree containing `address`, if any.
    fn covering_key(&self, address: &Address) -> Option<&Address> {
        self.changes.keys().find(|key| key.is_prefix_of(address))
    }

    fn covered_mut(&mut self, address: &Address) -> Result<&mut Resource> {
        let key = self
            .covering_key(address)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(address.clone()))?;
        let relative = address.relative_to(&key).unwrap_or_default();
        match self.changes.get_mut(&key) {
            Some(Some(subtree)) => Arc::make_mut(subtree)
                .descendant_mut(relative)
                .ok_or_else(|| StorageError::NotFound(address.clone())),
            _ => Err(StorageError::NotFound(address.clone())),
        }
    }
}

impl ReadResource for Overlay {
    fn read(&self, address: &Address) -> Result<Arc<Resource>> {
        let not_found = || StorageError::NotFound(address.clone());

        if let Some(key) = self.covering_key(address) {
            let relative = address.relative_to(key).unwrap_or_default();
            return match &self.changes[key] {
                Some(subtree) => descend(subtree, relative).ok_or_else(not_found),
                None => Err(not_found()),
            };
        }

        let base = self.base.read(address)?;
        let below: Vec<_> = self
            .changes
            .iter()
            .filter(|(key, _)| address.is_prefix_of(key))
            .collect();
        if below.is_empty() {
            return Ok(base);
        }

        let mut merged = Resource::clone(&base);
        for (key, change) in below {
            let relative = Address::from(key.relative_to(address).unwrap_or_default().to_vec());
            apply(&mut merged, &relative, change.clone())?;
        }
        Ok(Arc::new(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str) -> Address {
        Address::from_pairs([("child", name)])
    }

    fn seeded() -> Arc<ResourceTree> {
        let mut root = Resource::new();
        root.set_attribute("attr1", 1);
        let mut one = Resource::new();
        one.set_attribute("attribute1", 1);
        root.put_child(&child("one").elements()[0], Arc::new(one));
        Arc::new(ResourceTree::with_root(root))
    }

    #[test]
    fn test_writes_invisible_until_commit() {
        let tree = seeded();
        let mut overlay = Overlay::new(tree.clone());

        overlay.for_update(&Address::root()).unwrap().set_attribute("attr1", 2);
        assert_eq!(overlay.read(&Address::root()).unwrap().attribute("attr1"), 2.into());
        assert_eq!(tree.read(&Address::root()).unwrap().attribute("attr1"), 1.into());

        tree.commit(overlay.into_changes()).unwrap();
        assert_eq!(tree.read(&Address::root()).unwrap().attribute("attr1"), 2.into());
    }

    #[test]
    fn test_discard_leaves_tree_unchanged() {
        let tree = seeded();
        let before = tree.snapshot();
        let mut overlay = Overlay::new(tree.clone());

        overlay.for_update(&child("one")).unwrap().set_attribute("attribute1", 9);
        overlay.create(&child("two"), Resource::new()).unwrap();
        overlay.discard();
        tree.commit(overlay.into_changes()).unwrap();

        assert_eq!(tree.snapshot().root(), before.root());
        assert_eq!(tree.version(), 0);
    }

    #[test]
    fn test_create_rules() {
        let tree = seeded();
        let mut overlay = Overlay::new(tree);

        assert_eq!(
            overlay.create(&child("one"), Resource::new()).unwrap_err(),
            StorageError::AlreadyExists(child("one"))
        );
        let orphan = child("missing").append("x", "y");
        assert_eq!(
            overlay.create(&orphan, Resource::new()).unwrap_err(),
            StorageError::ParentMissing(orphan)
        );

        overlay.create(&child("two"), Resource::new()).unwrap();
        // Nested create lands inside the pending subtree
        overlay.create(&child("two").append("leaf", "a"), Resource::new()).unwrap();
        assert_eq!(overlay.touched().count(), 1);
        assert!(overlay.exists(&child("two").append("leaf", "a")));
    }

    #[test]
    fn test_remove_rules() {
        let tree = seeded();
        let mut overlay = Overlay::new(tree.clone());

        assert_eq!(
            overlay.remove(&child("nope")).unwrap_err(),
            StorageError::NotFound(child("nope"))
        );

        overlay.create(&child("one").append("leaf", "a"), Resource::new()).unwrap();
        assert_eq!(
            overlay.remove(&child("one")).unwrap_err(),
            StorageError::HasChildren(child("one"))
        );

        overlay.remove(&child("one").append("leaf", "a")).unwrap();
        let removed = overlay.remove(&child("one")).unwrap();
        assert_eq!(removed.attribute("attribute1"), 1.into());
        assert!(!overlay.exists(&child("one")));

        tree.commit(overlay.into_changes()).unwrap();
        assert!(!tree.exists(&child("one")));
    }

    #[test]
    fn test_parent_update_folds_pending_children() {
        let tree = seeded();
        let mut overlay = Overlay::new(tree.clone());

        overlay.for_update(&child("one")).unwrap().set_attribute("attribute1", 3);
        let root = overlay.read(&Address::root()).unwrap();
        assert_eq!(root.descendant(child("one").elements()).unwrap().attribute("attribute1"), 3.into());

        overlay.for_update(&Address::root()).unwrap().set_attribute("attr1", 5);
        assert_eq!(overlay.touched().count(), 1);

        tree.commit(overlay.into_changes()).unwrap();
        let committed = tree.snapshot();
        assert_eq!(committed.read(&Address::root()).unwrap().attribute("attr1"), 5.into());
        assert_eq!(committed.read(&child("one")).unwrap().attribute("attribute1"), 3.into());
    }

    #[test]
    fn test_revert_keeps_later_changes() {
        let tree = seeded();
        let mut overlay = Overlay::new(tree.clone());

        let before = overlay.read(&Address::root()).unwrap();
        let root = overlay.for_update(&Address::root()).unwrap();
        root.set_attribute("attr1", 2);
        root.set_attribute("attr2", 5);
        let after = overlay.read(&Address::root()).unwrap();
        // A later change to the same attribute wins over the revert
        overlay.for_update(&Address::root()).unwrap().set_attribute("attr1", 3);

        overlay.create(&child("two"), Resource::new()).unwrap();
        let created = overlay.read(&child("two")).unwrap();
        overlay.create(&child("two").append("leaf", "a"), Resource::new()).unwrap();

        overlay.revert(&Address::root(), Some(&before), Some(&after)).unwrap();
        overlay.revert(&child("two"), None, Some(&created)).unwrap();

        let root = overlay.read(&Address::root()).unwrap();
        assert_eq!(root.attribute("attr1"), 3.into());
        assert!(!root.attribute("attr2").is_defined());
        assert!(!overlay.exists(&child("two")));

        let removed = overlay.remove(&child("one")).unwrap();
        overlay.revert(&child("one"), Some(&removed), None).unwrap();
        assert_eq!(overlay.read(&child("one")).unwrap().attribute("attribute1"), 1.into());
    }

    #[test]
    fn test_disjoint_overlays_commit_independently() {
        let tree = seeded();
        let mut first = Overlay::new(tree.clone());
        let mut second = Overlay::new(tree.clone());

        first.for_update(&child("one")).unwrap().set_attribute("attribute1", 7);
        second.create(&child("two"), Resource::new()).unwrap();

        tree.commit(second.into_changes()).unwrap();
        tree.commit(first.into_changes()).unwrap();

        assert!(tree.exists(&child("two")));
        assert_eq!(tree.read(&child("one")).unwrap().attribute("attribute1"), 7.into());
    }
}
