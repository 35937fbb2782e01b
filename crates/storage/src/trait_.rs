//! Read abstraction over the resource tree and its transaction overlays.

use confman_core::{Address, PathElement, Resource};
use std::sync::Arc;

/// Error type for resource tree operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur while reading or changing resources.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// No resource at the address
    #[error("Resource not found: {0}")]
    NotFound(Address),

    /// Create target already exists
    #[error("Resource already exists: {0}")]
    AlreadyExists(Address),

    /// Create target has no parent
    #[error("Parent of {0} does not exist")]
    ParentMissing(Address),

    /// Remove target still has children
    #[error("Resource {0} has children and cannot be removed")]
    HasChildren(Address),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Something resources can be read from.
///
/// Implemented by the base tree, by point-in-time snapshots and by
/// transaction overlays, which see their own pending changes.
pub trait ReadResource {
    /// Read the resource at `address`.
    fn read(&self, address: &Address) -> Result<Arc<Resource>>;

    /// Whether a resource exists at `address`.
    fn exists(&self, address: &Address) -> bool {
        self.read(address).is_ok()
    }
}

/// Walk `path` below `root`, sharing the resulting node.
pub(crate) fn descend(root: &Arc<Resource>, path: &[PathElement]) -> Option<Arc<Resource>> {
    let mut node = Arc::clone(root);
    for element in path {
        node = node.child_arc(element)?;
    }
    Some(node)
}
