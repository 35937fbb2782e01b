//! Execution status tracking and the two cancellation paths.
//!
//! Every in-flight operation has one [`ActiveOperation`]. The caller's handle
//! and the `cancel` operation on `active-operation=<id>` both go through
//! [`ActiveOperation::request_cancel`], which records who asked and trips a
//! single [`CancellationToken`]. The engine checks that token at its
//! suspension points; blocking handler calls observe it through
//! [`OperationContext::interruptible`](crate::OperationContext::interruptible).

use confman_core::{Address, ExecutionStatus, ModelValue, OperationId, Time, ACTIVE_OPERATION};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Who asked for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    /// The submitting caller's handle
    Caller,
    /// A `cancel` request against the introspection resource
    Management,
}

/// The first accepted cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    /// Who asked
    pub source: CancelSource,
    /// Status when the request arrived
    pub status: ExecutionStatus,
}

struct ActiveState {
    status: ExecutionStatus,
    request: Option<CancelRequest>,
}

/// Introspectable, cancellable projection of one in-flight operation.
pub struct ActiveOperation {
    id: OperationId,
    name: String,
    address: Address,
    started_at: Time,
    token: CancellationToken,
    state: Mutex<ActiveState>,
}

impl ActiveOperation {
    /// Track a newly submitted operation.
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            id: OperationId::new(),
            name: name.into(),
            address,
            started_at: chrono::Utc::now(),
            token: CancellationToken::new(),
            state: Mutex::new(ActiveState {
                status: ExecutionStatus::Executing,
                request: None,
            }),
        }
    }

    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Target address of the operation.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Introspection address, `active-operation=<id>`.
    pub fn resource_address(&self) -> Address {
        Address::root().append(ACTIVE_OPERATION, self.id.to_string())
    }

    /// Current status.
    pub fn status(&self) -> ExecutionStatus {
        self.state.lock().status
    }

    /// The first accepted cancellation request, if any.
    pub fn cancel_request(&self) -> Option<CancelRequest> {
        self.state.lock().request
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token tripped by the first cancellation request.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Move to `next`. Invalid transitions are logged and ignored.
    pub fn set_status(&self, next: ExecutionStatus) -> bool {
        let mut state = self.state.lock();
        if state.status == next {
            return true;
        }
        if !state.status.can_transition_to(next) {
            warn!(
                operation = %self.id,
                from = %state.status,
                to = %next,
                "Ignoring invalid execution status transition"
            );
            return false;
        }
        state.status = next;
        true
    }

    /// Ask for cancellation.
    ///
    /// Returns `false` when the operation already reached a terminal status,
    /// in which case nothing changes. A second request while one is pending
    /// is accepted but keeps the first request's source.
    pub fn request_cancel(&self, source: CancelSource) -> bool {
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        if state.request.is_none() {
            info!(operation = %self.id, ?source, status = %state.status, "Cancellation requested");
            state.request = Some(CancelRequest {
                source,
                status: state.status,
            });
            self.token.cancel();
        }
        true
    }

    /// Close the cancellation window before committing.
    ///
    /// Moves to `Completed` unless a cancellation is pending, so that no
    /// request can be accepted and then ignored by the commit.
    pub fn begin_commit(&self) -> bool {
        let mut state = self.state.lock();
        if state.request.is_some() {
            return false;
        }
        state.status = ExecutionStatus::Completed;
        true
    }

    /// Introspection model: `{op, address, execution-status, cancelled, started-at}`.
    pub fn to_model(&self) -> ModelValue {
        let state = self.state.lock();
        let mut model = BTreeMap::new();
        model.insert("op".to_string(), ModelValue::from(self.name.as_str()));
        model.insert("address".to_string(), ModelValue::from(self.address.to_string()));
        model.insert("execution-status".to_string(), ModelValue::from(state.status.to_string()));
        model.insert("cancelled".to_string(), ModelValue::from(state.request.is_some()));
        model.insert("started-at".to_string(), ModelValue::from(self.started_at.to_rfc3339()));
        ModelValue::Object(model)
    }
}

/// Registry of in-flight operations, the `active-operation` namespace.
#[derive(Default)]
pub struct ActiveOperations {
    operations: RwLock<IndexMap<OperationId, Arc<ActiveOperation>>>,
}

impl ActiveOperations {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation.
    pub fn insert(&self, operation: Arc<ActiveOperation>) {
        self.operations.write().insert(operation.id(), operation);
    }

    /// Unregister an operation.
    pub fn remove(&self, id: OperationId) -> Option<Arc<ActiveOperation>> {
        self.operations.write().shift_remove(&id)
    }

    /// Look up by id.
    pub fn get(&self, id: OperationId) -> Option<Arc<ActiveOperation>> {
        self.operations.read().get(&id).cloned()
    }

    /// Look up by introspection address.
    pub fn resolve(&self, address: &Address) -> Option<Arc<ActiveOperation>> {
        let [element] = address.elements() else {
            return None;
        };
        if element.key != ACTIVE_OPERATION {
            return None;
        }
        self.get(element.value.parse().ok()?)
    }

    /// Every in-flight operation, in submission order.
    pub fn list(&self) -> Vec<Arc<ActiveOperation>> {
        self.operations.read().values().cloned().collect()
    }

    /// Number of in-flight operations.
    pub fn len(&self) -> usize {
        self.operations.read().len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.operations.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let op = ActiveOperation::new("composite", Address::root());
        op.set_status(ExecutionStatus::AwaitingStability);

        assert!(op.request_cancel(CancelSource::Caller));
        assert!(op.request_cancel(CancelSource::Management));
        assert!(op.is_cancelled());
        assert_eq!(
            op.cancel_request(),
            Some(CancelRequest {
                source: CancelSource::Caller,
                status: ExecutionStatus::AwaitingStability,
            })
        );
    }

    #[test]
    fn test_terminal_operation_ignores_cancel() {
        let op = ActiveOperation::new("good", Address::root());
        assert!(op.begin_commit());
        assert_eq!(op.status(), ExecutionStatus::Completed);

        assert!(!op.request_cancel(CancelSource::Management));
        assert!(!op.is_cancelled());
        assert_eq!(op.cancel_request(), None);
    }

    #[test]
    fn test_pending_cancel_blocks_commit() {
        let op = ActiveOperation::new("good", Address::root());
        op.request_cancel(CancelSource::Management);
        assert!(!op.begin_commit());
        assert_eq!(op.status(), ExecutionStatus::Executing);
    }

    #[test]
    fn test_invalid_transition_ignored() {
        let op = ActiveOperation::new("good", Address::root());
        assert!(op.set_status(ExecutionStatus::RollingBack));
        assert!(!op.set_status(ExecutionStatus::Executing));
        assert_eq!(op.status(), ExecutionStatus::RollingBack);
    }

    #[test]
    fn test_registry_resolves_introspection_address() {
        let registry = ActiveOperations::new();
        let op = Arc::new(ActiveOperation::new("composite", Address::root()));
        registry.insert(op.clone());

        let found = registry.resolve(&op.resource_address()).unwrap();
        assert_eq!(found.id(), op.id());
        assert!(registry.resolve(&Address::from_pairs([("active-operation", "nope")])).is_none());

        let model = found.to_model();
        assert_eq!(model.get("op"), Some(&ModelValue::from("composite")));
        assert_eq!(model.get("execution-status"), Some(&ModelValue::from("executing")));

        registry.remove(op.id());
        assert!(registry.is_empty());
    }
}
