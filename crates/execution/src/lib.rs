//! Staged execution of management operations.
//!
//! An operation runs as a queue of steps through three stages:
//! MODEL reads and changes a private overlay of the resource tree, RUNTIME
//! changes services, and VERIFY waits for those services to settle. The
//! overlay is committed only when every stage succeeds; otherwise service
//! changes are undone in reverse order and the tree is left untouched.
//! Operations touching overlapping addresses are serialized in arrival
//! order and may be cancelled by their caller or through the model.

#![warn(missing_docs)]

pub mod error;
pub mod service;
pub mod rollback;
pub mod cancellation;
pub mod step;
pub mod context;
pub mod liaison;
pub mod composite;
pub mod global;
pub mod engine;
mod scheduler;


pub use error::{ContractViolation, ExecutionError, OperationError};
pub use service::{InMemoryServiceContainer, NoopService, Service, ServiceContainer, ServiceError, ServiceState};
pub use rollback::{rollback_fn, RollbackAction, RollbackContext, RollbackJournal};
pub use cancellation::{ActiveOperation, ActiveOperations, CancelRequest, CancelSource};
pub use step::{HandlerRegistry, OperationStepHandler, Step, StepQueue};
pub use context::OperationContext;
pub use liaison::{ServiceLiaison, Stability};
pub use composite::CompositeOperationHandler;
pub use global::register_global_operations;
pub use engine::{ControllerBuilder, ControllerConfig, ModelController, OperationHandle};
