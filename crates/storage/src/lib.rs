//! Resource tree storage for Confman.
//!
//! This crate provides the shared, versioned configuration tree, the
//! per-transaction overlays that writers work in, and the FIFO address locks
//! that serialize writers of overlapping subtrees.

#![warn(missing_docs)]

pub mod trait_;
pub mod tree;
pub mod overlay;
pub mod lock;

pub use trait_::{ReadResource, Result, StorageError};
pub use tree::{Change, ResourceTree, TreeSnapshot};
pub use overlay::Overlay;
pub use lock::{Acquisition, AddressLocks, PendingLock};
