//! Pipeline stages and execution status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered execution phase of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Stage {
    /// Read and update the resource overlay
    Model,
    /// Act on runtime services
    Runtime,
    /// Wait for runtime services to converge, then verify
    Verify,
    /// Pipeline finished, commit pending
    Done,
}

impl Stage {
    /// Stages in execution order, excluding `Done`.
    pub const EXECUTABLE: [Stage; 3] = [Stage::Model, Stage::Runtime, Stage::Verify];

    /// The following stage. `Done` is last.
    pub fn next(self) -> Stage {
        match self {
            Stage::Model => Stage::Runtime,
            Stage::Runtime => Stage::Verify,
            Stage::Verify | Stage::Done => Stage::Done,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Model => write!(f, "MODEL"),
            Stage::Runtime => write!(f, "RUNTIME"),
            Stage::Verify => write!(f, "VERIFY"),
            Stage::Done => write!(f, "DONE"),
        }
    }
}

/// Externally visible status of an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStatus {
    /// Running a step
    Executing,
    /// Waiting for an overlapping address lock held by another operation
    AwaitingOtherOperation,
    /// Waiting for runtime services to converge
    AwaitingStability,
    /// Unwinding recorded rollback actions
    RollingBack,
    /// Finished, whatever the outcome
    Completed,
    /// Finished by cancellation
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further progress toward commit is possible.
    ///
    /// `RollingBack` is terminal in this sense: cancel requests are refused
    /// from it on, and the only moves left are to the final `Completed` or
    /// `Cancelled` reported once the rollback finishes.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::RollingBack | ExecutionStatus::Completed | ExecutionStatus::Cancelled
        )
    }

    /// Whether the operation is blocked at an engine suspension point.
    pub fn is_awaiting(self) -> bool {
        matches!(
            self,
            ExecutionStatus::AwaitingOtherOperation | ExecutionStatus::AwaitingStability
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// `Executing` cycles through the awaiting states; once rolling back only
    /// the final states may follow; `Completed` and `Cancelled` are final.
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Executing, AwaitingOtherOperation | AwaitingStability) => true,
            (AwaitingOtherOperation | AwaitingStability, Executing) => true,
            (Executing | AwaitingOtherOperation | AwaitingStability, RollingBack) => true,
            (Executing | RollingBack, Completed | Cancelled) => true,
            (AwaitingOtherOperation | AwaitingStability, Completed | Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Executing => "executing",
            ExecutionStatus::AwaitingOtherOperation => "awaiting-other-operation",
            ExecutionStatus::AwaitingStability => "awaiting-stability",
            ExecutionStatus::RollingBack => "rolling-back",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert!(Stage::Model < Stage::Runtime);
        assert!(Stage::Runtime < Stage::Verify);
        assert!(Stage::Verify < Stage::Done);
        assert_eq!(Stage::Verify.next(), Stage::Done);
    }

    #[test]
    fn test_status_transitions() {
        use ExecutionStatus::*;
        assert!(Executing.can_transition_to(AwaitingStability));
        assert!(AwaitingStability.can_transition_to(Executing));
        assert!(AwaitingOtherOperation.can_transition_to(RollingBack));
        assert!(RollingBack.is_terminal());
        assert!(RollingBack.can_transition_to(Cancelled));
        assert!(RollingBack.can_transition_to(Completed));
        assert!(!RollingBack.can_transition_to(Executing));
        assert!(!RollingBack.can_transition_to(AwaitingOtherOperation));
        assert!(!Completed.can_transition_to(RollingBack));
        assert!(!Cancelled.can_transition_to(Completed));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(ExecutionStatus::AwaitingOtherOperation.to_string(), "awaiting-other-operation");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::AwaitingStability).unwrap(),
            r#""awaiting-stability""#
        );
    }
}
