//! Service naming shared with the external service container.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-wide unique, dot-separated service name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceName(String);

impl ServiceName {
    /// A single-segment name.
    pub fn of(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Append a segment: `base.segment`.
    pub fn append(&self, segment: impl AsRef<str>) -> Self {
        Self(format!("{}.{}", self.0, segment.as_ref()))
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `self` equals `other` or is one of its dotted ancestors.
    pub fn is_parent_of(&self, other: &ServiceName) -> bool {
        other.0 == self.0
            || (other.0.len() > self.0.len()
                && other.0.starts_with(&self.0)
                && other.0.as_bytes()[self.0.len()] == b'.')
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dynamic capability: its services are named `base + "." + dynamic-part`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capability {
    base: String,
}

impl Capability {
    /// Capability with the given base name, e.g. `org.wildfly.network.socket-binding`.
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    /// Base name.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Service name for one dynamic instance of the capability.
    pub fn service_name(&self, dynamic: &str) -> ServiceName {
        ServiceName::of(self.base.as_str()).append(dynamic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_name() {
        let cap = Capability::new("org.wildfly.network.socket-binding");
        assert_eq!(
            cap.service_name("http").as_str(),
            "org.wildfly.network.socket-binding.http"
        );
    }

    #[test]
    fn test_parent() {
        let base = ServiceName::of("jboss");
        assert!(base.is_parent_of(&base.append("good-service")));
        assert!(!base.is_parent_of(&ServiceName::of("jbossx")));
    }
}
