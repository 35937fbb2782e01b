//! The versioned, copy-on-write base resource tree.

use crate::trait_::{descend, ReadResource, Result, StorageError};
use confman_core::{Address, Resource};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// One pending change to the base tree: the subtree now at `address`, or
/// `None` when the resource is removed.
pub type Change = (Address, Option<Arc<Resource>>);

/// The single, shared configuration tree.
///
/// Readers clone the current root pointer and so always see a complete
/// committed version. Writers never touch the base tree directly: they build
/// an [`Overlay`](crate::Overlay) and hand its changes to [`commit`](Self::commit),
/// which swaps in a new root in one step.
pub struct ResourceTree {
    current: RwLock<TreeSnapshot>,
}

/// A committed version of the tree.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    root: Arc<Resource>,
    version: u64,
}

impl TreeSnapshot {
    /// Root resource of this version.
    pub fn root(&self) -> &Arc<Resource> {
        &self.root
    }

    /// Version number, incremented by every non-empty commit.
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl ReadResource for TreeSnapshot {
    fn read(&self, address: &Address) -> Result<Arc<Resource>> {
        descend(&self.root, address.elements()).ok_or_else(|| StorageError::NotFound(address.clone()))
    }
}

impl ResourceTree {
    /// Create a tree with an empty root.
    pub fn new() -> Self {
        Self::with_root(Resource::new())
    }

    /// Create a tree from an existing root resource.
    pub fn with_root(root: Resource) -> Self {
        Self {
            current: RwLock::new(TreeSnapshot {
                root: Arc::new(root),
                version: 0,
            }),
        }
    }

    /// The current committed version.
    pub fn snapshot(&self) -> TreeSnapshot {
        self.current.read().clone()
    }

    /// Current version number.
    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Apply `changes` and publish the result as the next version.
    ///
    /// Either every change applies or none does; on error the tree is left
    /// untouched. Returns the new version.
    pub fn commit(&self, changes: Vec<Change>) -> Result<u64> {
        let mut current = self.current.write();
        if changes.is_empty() {
            return Ok(current.version);
        }

        let mut next = Resource::clone(&current.root);
        for (address, change) in changes {
            apply(&mut next, &address, change)?;
        }

        current.root = Arc::new(next);
        current.version += 1;
        debug!(version = current.version, "Committed resource tree version");
        Ok(current.version)
    }
}

impl Default for ResourceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadResource for ResourceTree {
    fn read(&self, address: &Address) -> Result<Arc<Resource>> {
        self.snapshot().read(address)
    }
}

/// Replace or remove the subtree at `address` inside `root`.
pub(crate) fn apply(root: &mut Resource, address: &Address, change: Option<Arc<Resource>>) -> Result<()> {
    let Some(last) = address.last() else {
        return match change {
            Some(replacement) => {
                *root = Resource::clone(&replacement);
                Ok(())
            }
            None => Err(StorageError::Other("the root resource cannot be removed".to_string())),
        };
    };

    let parent_path = &address.elements()[..address.len() - 1];
    let parent = root
        .descendant_mut(parent_path)
        .ok_or_else(|| StorageError::ParentMissing(address.clone()))?;
    match change {
        Some(replacement) => {
            parent.put_child(last, replacement);
        }
        None => {
            parent.remove_child(last);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(name: &str) -> Address {
        Address::from_pairs([("child", name)])
    }

    #[test]
    fn test_commit_publishes_new_version() {
        let tree = ResourceTree::new();
        let before = tree.snapshot();

        let mut one = Resource::new();
        one.set_attribute("attribute1", 1);
        let version = tree.commit(vec![(child("one"), Some(Arc::new(one)))]).unwrap();

        assert_eq!(version, 1);
        assert!(tree.exists(&child("one")));
        // Old snapshots are unaffected
        assert!(!before.exists(&child("one")));
    }

    #[test]
    fn test_failed_commit_changes_nothing() {
        let tree = ResourceTree::new();
        let orphan = child("one").append("grandchild", "x");
        let result = tree.commit(vec![
            (child("two"), Some(Arc::new(Resource::new()))),
            (orphan.clone(), Some(Arc::new(Resource::new()))),
        ]);

        assert_eq!(result, Err(StorageError::ParentMissing(orphan)));
        assert_eq!(tree.version(), 0);
        assert!(!tree.exists(&child("two")));
    }

    #[test]
    fn test_empty_commit_keeps_version() {
        let tree = ResourceTree::new();
        assert_eq!(tree.commit(Vec::new()).unwrap(), 0);
    }

    #[test]
    fn test_remove_root_rejected() {
        let tree = ResourceTree::new();
        assert!(tree.commit(vec![(Address::root(), None)]).is_err());
    }
}
