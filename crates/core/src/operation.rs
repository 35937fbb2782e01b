//! Operation envelopes submitted by callers.

use crate::address::Address;
use crate::value::ModelValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the composite operation.
pub const COMPOSITE: &str = "composite";

/// An immutable management request.
///
/// A composite operation carries an ordered list of child operations which
/// execute as one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Operation name, e.g. `write-attribute`
    pub name: String,

    /// Target address
    #[serde(default)]
    pub address: Address,

    /// Named parameters
    #[serde(default)]
    pub params: BTreeMap<String, ModelValue>,

    /// Roll back the whole composite on any runtime failure (default true)
    #[serde(
        default,
        rename = "rollback-on-runtime-failure",
        skip_serializing_if = "Option::is_none"
    )]
    pub rollback_on_runtime_failure: Option<bool>,

    /// Child operations of a composite
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Operation>,
}

impl Operation {
    /// Create an operation against `address`.
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            params: BTreeMap::new(),
            rollback_on_runtime_failure: None,
            steps: Vec::new(),
        }
    }

    /// Create a composite of `steps` targeting the root.
    pub fn composite(steps: Vec<Operation>) -> Self {
        Self {
            steps,
            ..Self::new(COMPOSITE, Address::root())
        }
    }

    /// Set a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ModelValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Set the rollback-on-runtime-failure flag.
    pub fn with_rollback_on_runtime_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_runtime_failure = Some(rollback);
        self
    }

    /// Whether this operation expands into child steps.
    pub fn is_composite(&self) -> bool {
        self.name == COMPOSITE
    }

    /// Effective rollback-on-runtime-failure flag.
    pub fn rolls_back_on_runtime_failure(&self) -> bool {
        self.rollback_on_runtime_failure.unwrap_or(true)
    }

    /// A defined parameter value.
    pub fn param(&self, name: &str) -> Option<&ModelValue> {
        self.params.get(name).filter(|v| v.is_defined())
    }

    /// A required parameter value.
    pub fn require(&self, name: &str) -> Result<&ModelValue, MissingParameter> {
        self.param(name).ok_or_else(|| MissingParameter {
            operation: self.name.clone(),
            parameter: name.to_string(),
        })
    }
}

/// A required parameter was absent or undefined.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("operation '{operation}' requires parameter '{parameter}'")]
pub struct MissingParameter {
    /// Operation name
    pub operation: String,
    /// Parameter name
    pub parameter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_parses() {
        let json = r#"{
            "name": "composite",
            "address": [],
            "rollback-on-runtime-failure": false,
            "steps": [
                {"name": "write-attribute", "address": [["child", "one"]],
                 "params": {"name": "attr1", "value": 2}}
            ]
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();
        assert!(op.is_composite());
        assert!(!op.rolls_back_on_runtime_failure());
        assert_eq!(op.steps.len(), 1);
        assert_eq!(op.steps[0].require("value").unwrap().as_int(), Some(2));
        assert_eq!(op.steps[0].address.to_string(), "/child=one");
    }

    #[test]
    fn test_defaults() {
        let op: Operation = serde_json::from_str(r#"{"name": "read-resource"}"#).unwrap();
        assert!(op.address.is_root());
        assert!(op.rolls_back_on_runtime_failure());
        assert!(op.steps.is_empty());
    }

    #[test]
    fn test_undefined_param_is_missing() {
        let op = Operation::new("x", Address::root()).with_param("name", ModelValue::Undefined);
        let err = op.require("name").unwrap_err();
        assert_eq!(err.to_string(), "operation 'x' requires parameter 'name'");
    }
}
