//! Confman core data model.
//!
//! This crate defines the values, addresses, resources and envelopes shared
//! by the resource tree and the staged execution engine.

#![warn(missing_docs)]

mod id;
mod value;
mod address;
mod resource;
mod operation;
mod outcome;
mod status;
mod service;

pub use id::OperationId;
pub use value::ModelValue;
pub use address::{Address, AddressParseError, PathElement};
pub use resource::Resource;
pub use operation::{MissingParameter, Operation, COMPOSITE};
pub use outcome::{OperationResult, Outcome};
pub use status::{ExecutionStatus, Stage};
pub use service::{Capability, ServiceName};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// Child type of the introspection resources of in-flight operations.
pub const ACTIVE_OPERATION: &str = "active-operation";
