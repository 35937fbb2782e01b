//! Errors raised while executing operations.

use crate::service::ServiceError;
use confman_core::{Address, MissingParameter, OperationResult, Stage};
use confman_storage::StorageError;

/// Error returned by a step or by the engine at a suspension point.
///
/// Step-level errors never escape the scheduler: they are converted into the
/// operation's terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Bad or missing parameter, unknown operation
    #[error("{0}")]
    Validation(String),

    /// Handler-reported failure
    #[error("{0}")]
    Failed(String),

    /// Cancellation observed at a check point
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking handler call was interrupted
    #[error("Interrupted while blocked in a handler")]
    Interrupted,

    /// Waiting for a lock would deadlock with another operation
    #[error("Waiting for the lock on {0} would deadlock with another operation")]
    Deadlock(Address),

    /// Resource tree error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Service container error
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// A handler broke the step contract
    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),
}

impl OperationError {
    /// Create a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a handler failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<MissingParameter> for OperationError {
    fn from(err: MissingParameter) -> Self {
        Self::Validation(err.to_string())
    }
}

/// A handler misused the step API.
///
/// These break engine invariants and are never reported as an ordinary
/// failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContractViolation {
    /// `complete_step` called more than once
    #[error("step of '{operation}' completed more than once")]
    StepCompletedTwice {
        /// Operation name
        operation: String,
    },

    /// Handler returned without calling `complete_step`
    #[error("step of '{operation}' returned without completing")]
    StepNotCompleted {
        /// Operation name
        operation: String,
    },

    /// Step added for a stage that already finished
    #[error("cannot add a {requested} step while in {current}")]
    EarlierStage {
        /// Stage asked for
        requested: Stage,
        /// Stage being executed
        current: Stage,
    },

    /// The same resource was created twice in one operation
    #[error("resource {0} addressed twice")]
    ResourceAddressedTwice(Address),

    /// Service change requested outside the runtime stage
    #[error("service changes are only allowed in RUNTIME, not {stage}")]
    ServiceOutsideRuntime {
        /// Stage being executed
        stage: Stage,
    },

    /// Resource tree change requested outside the model stage
    #[error("resource changes are only allowed in MODEL, not {stage}")]
    ModelOutsideModelStage {
        /// Stage being executed
        stage: Stage,
    },
}

/// Why an operation did not produce a plain response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// Cancelled while the engine was waiting; carries the rolled back response
    #[error("Operation cancelled")]
    Cancelled(OperationResult),

    /// A handler broke the step contract; the operation was rolled back
    #[error("{0}")]
    Contract(ContractViolation),

    /// The operation task ended without reporting
    #[error("Operation aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use confman_core::Operation;

    #[test]
    fn test_missing_parameter_is_validation() {
        let op = Operation::new("write-attribute", Address::root());
        let err: OperationError = op.require("name").unwrap_err().into();
        assert!(matches!(err, OperationError::Validation(_)));
    }

    #[test]
    fn test_messages() {
        let err = OperationError::from(ContractViolation::EarlierStage {
            requested: Stage::Model,
            current: Stage::Runtime,
        });
        assert_eq!(
            err.to_string(),
            "Contract violation: cannot add a MODEL step while in RUNTIME"
        );
        assert_eq!(
            OperationError::from(StorageError::NotFound(Address::root())).to_string(),
            "Resource not found: /"
        );
    }
}
