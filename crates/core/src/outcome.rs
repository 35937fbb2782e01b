//! Result envelopes produced for callers.

use crate::value::ModelValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// Committed
    Success,
    /// Failed and rolled back
    Failed,
    /// Cancelled and rolled back
    Cancelled,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failed => write!(f, "failed"),
            Outcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The response to one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    /// Terminal outcome
    pub outcome: Outcome,

    /// Result value accumulated by the operation's steps
    #[serde(default)]
    pub result: ModelValue,

    /// Why the operation failed or was cancelled
    #[serde(
        default,
        rename = "failure-description",
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_description: Option<String>,
}

impl OperationResult {
    /// A successful response.
    pub fn success(result: ModelValue) -> Self {
        Self {
            outcome: Outcome::Success,
            result,
            failure_description: None,
        }
    }

    /// A failed response.
    pub fn failed(result: ModelValue, description: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Failed,
            result,
            failure_description: Some(description.into()),
        }
    }

    /// A cancelled response.
    pub fn cancelled(result: ModelValue, description: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Cancelled,
            result,
            failure_description: Some(description.into()),
        }
    }

    /// Whether the outcome is success.
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let ok = OperationResult::success(1.into());
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"outcome":"success","result":1}"#
        );

        let failed = OperationResult::failed(ModelValue::Undefined, "boom");
        assert_eq!(
            serde_json::to_string(&failed).unwrap(),
            r#"{"outcome":"failed","result":null,"failure-description":"boom"}"#
        );
    }
}
