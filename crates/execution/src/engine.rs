//! The model controller: submission, commit and rollback of operations.

use crate::cancellation::{ActiveOperation, ActiveOperations, CancelSource};
use crate::composite::step_key;
use crate::context::OperationContext;
use crate::error::{ExecutionError, OperationError};
use crate::global::register_global_operations;
use crate::scheduler;
use crate::service::{InMemoryServiceContainer, ServiceContainer};
use crate::step::{HandlerRegistry, OperationStepHandler, Step};
use confman_core::{
    Address, ExecutionStatus, ModelValue, Operation, OperationId, OperationResult, Outcome, Resource,
};
use confman_storage::{AddressLocks, ReadResource, ResourceTree, StorageError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

/// Configuration for the model controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControllerConfig {
    /// Operations executing at once; further submissions wait for a slot
    pub max_concurrent_operations: NonZeroUsize,
    /// Limit on waiting for services in VERIFY (None = wait forever)
    #[serde(with = "millis_opt")]
    pub stability_timeout: Option<Duration>,
    /// Limit on waiting for services after rollback
    #[serde(with = "millis")]
    pub rollback_stability_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: NonZeroUsize::new(16).unwrap_or(NonZeroUsize::MIN),
            stability_timeout: None,
            rollback_stability_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Create a new configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of concurrently executing operations.
    pub fn with_max_concurrent_operations(mut self, max: NonZeroUsize) -> Self {
        self.max_concurrent_operations = max;
        self
    }

    /// Set the VERIFY stability timeout.
    pub fn with_stability_timeout(mut self, timeout: Duration) -> Self {
        self.stability_timeout = Some(timeout);
        self
    }

    /// Set the post-rollback stability timeout.
    pub fn with_rollback_stability_timeout(mut self, timeout: Duration) -> Self {
        self.rollback_stability_timeout = timeout;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// State shared by the controller and every operation it runs.
pub(crate) struct Shared {
    pub(crate) tree: Arc<ResourceTree>,
    pub(crate) locks: Arc<AddressLocks>,
    pub(crate) registry: RwLock<HandlerRegistry>,
    pub(crate) services: Arc<dyn ServiceContainer>,
    pub(crate) active: ActiveOperations,
    pub(crate) config: ControllerConfig,
    permits: Arc<Semaphore>,
}

/// Builder for [`ModelController`].
pub struct ControllerBuilder {
    config: ControllerConfig,
    root: Resource,
    services: Option<Arc<dyn ServiceContainer>>,
    registry: HandlerRegistry,
}

impl ControllerBuilder {
    /// Set the configuration.
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the initial root resource.
    pub fn with_root(mut self, root: Resource) -> Self {
        self.root = root;
        self
    }

    /// Set the service container.
    pub fn with_services(mut self, services: Arc<dyn ServiceContainer>) -> Self {
        self.services = Some(services);
        self
    }

    /// Register an operation handler.
    pub fn with_handler(mut self, name: impl Into<String>, handler: Arc<dyn OperationStepHandler>) -> Self {
        self.registry.register(name, handler);
        self
    }

    /// Build the controller.
    pub fn build(self) -> ModelController {
        let services = self
            .services
            .unwrap_or_else(|| Arc::new(InMemoryServiceContainer::new()));
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_operations.get()));
        ModelController {
            shared: Arc::new(Shared {
                tree: Arc::new(ResourceTree::with_root(self.root)),
                locks: Arc::new(AddressLocks::new()),
                registry: RwLock::new(self.registry),
                services,
                active: ActiveOperations::new(),
                config: self.config,
                permits,
            }),
        }
    }
}

/// Executes operations against one resource tree.
///
/// Each submitted operation runs on its own tokio task:
/// ```text
/// MODEL → RUNTIME → VERIFY → commit
///    ↘        ↘        ↘
///              rollback
/// ```
/// Operations whose locked addresses overlap run one after the other;
/// everything else runs in parallel, up to the configured limit.
#[derive(Clone)]
pub struct ModelController {
    shared: Arc<Shared>,
}

impl ModelController {
    /// Create a controller with an empty root, the global operations and an
    /// in-process service container.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start building a controller. The global operations are pre-registered.
    pub fn builder() -> ControllerBuilder {
        let mut registry = HandlerRegistry::new();
        register_global_operations(&mut registry);
        ControllerBuilder {
            config: ControllerConfig::default(),
            root: Resource::new(),
            services: None,
            registry,
        }
    }

    /// Register an operation handler.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn OperationStepHandler>) {
        self.shared.registry.write().register(name, handler);
    }

    /// The resource tree.
    pub fn tree(&self) -> &Arc<ResourceTree> {
        &self.shared.tree
    }

    /// The service container.
    pub fn services(&self) -> &Arc<dyn ServiceContainer> {
        &self.shared.services
    }

    /// The configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Read a committed resource.
    pub fn read_resource(&self, address: &Address) -> Result<Arc<Resource>, StorageError> {
        self.shared.tree.read(address)
    }

    /// In-flight operations.
    pub fn active_operations(&self) -> Vec<Arc<ActiveOperation>> {
        self.shared.active.list()
    }

    /// Submit an operation for asynchronous execution.
    pub fn submit(&self, operation: Operation) -> OperationHandle {
        let active = Arc::new(ActiveOperation::new(operation.name.clone(), operation.address.clone()));
        self.shared.active.insert(Arc::clone(&active));
        debug!(operation = %active.id(), name = %operation.name, address = %operation.address, "Operation submitted");

        let (tx, rx) = watch::channel(None);
        let shared = Arc::clone(&self.shared);
        let task_active = Arc::clone(&active);
        tokio::spawn(async move {
            let finish = Finish {
                shared: Arc::clone(&shared),
                id: task_active.id(),
            };
            let terminal = execute(&shared, &task_active, operation).await;
            // Unregister before publishing so a caller never sees its result
            // while the operation still holds locks
            drop(finish);
            let _ = tx.send(Some(terminal));
        });

        OperationHandle { active, done: rx }
    }

    /// Submit an operation and wait for its result.
    pub async fn execute(&self, operation: Operation) -> Result<OperationResult, ExecutionError> {
        self.submit(operation).result().await
    }
}

impl Default for ModelController {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases an operation's locks and unregisters it, also when its task panics.
struct Finish {
    shared: Arc<Shared>,
    id: OperationId,
}

impl Drop for Finish {
    fn drop(&mut self) {
        self.shared.locks.release_all(self.id);
        self.shared.active.remove(self.id);
    }
}

type Terminal = Result<OperationResult, ExecutionError>;

/// The caller's handle on a submitted operation.
pub struct OperationHandle {
    active: Arc<ActiveOperation>,
    done: watch::Receiver<Option<Terminal>>,
}

impl OperationHandle {
    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.active.id()
    }

    /// Current execution status.
    pub fn status(&self) -> ExecutionStatus {
        self.active.status()
    }

    /// Address of the operation's introspection resource.
    pub fn resource_address(&self) -> Address {
        self.active.resource_address()
    }

    /// Cancel from the caller's side and wait for the operation to finish.
    ///
    /// Returns whether the operation ended cancelled. Cancelling a finished
    /// operation returns `false` and changes nothing.
    pub async fn cancel(&self) -> bool {
        if !self.active.request_cancel(CancelSource::Caller) {
            return false;
        }
        match self.wait().await {
            Err(ExecutionError::Cancelled(_)) => true,
            Ok(response) => response.outcome == Outcome::Cancelled,
            Err(_) => false,
        }
    }

    /// Wait for the operation's result.
    pub async fn result(&self) -> Result<OperationResult, ExecutionError> {
        self.wait().await
    }

    /// Whether the operation finished.
    pub fn is_finished(&self) -> bool {
        self.done.borrow().is_some()
    }

    async fn wait(&self) -> Terminal {
        let mut done = self.done.clone();
        let terminal = match done.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        terminal.unwrap_or_else(|| Err(ExecutionError::Aborted("operation task ended without a result".to_string())))
    }
}

async fn execute(shared: &Arc<Shared>, active: &Arc<ActiveOperation>, operation: Operation) -> Terminal {
    let token = active.token().clone();
    let permit = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
    };

    let mut ctx = OperationContext::new(Arc::clone(shared), Arc::clone(active), &operation);
    let pipeline = if permit.is_none() {
        Err(OperationError::Cancelled)
    } else {
        match ctx.handler(&operation.name) {
            Ok(handler) => {
                ctx.queue.push(Step::initial(Arc::new(operation), handler));
                scheduler::run(&mut ctx).await
            }
            Err(err) => Err(err),
        }
    };

    let terminal = match pipeline {
        Ok(()) => commit(&mut ctx).await,
        Err(err) => roll_back(&mut ctx, err).await,
    };
    drop(permit);
    terminal
}

async fn commit(ctx: &mut OperationContext) -> Terminal {
    if !ctx.active.begin_commit() {
        return roll_back(ctx, OperationError::Cancelled).await;
    }

    let changes = ctx.overlay.take_changes();
    match ctx.shared.tree.commit(changes) {
        Ok(version) => {
            let result = finish_result(ctx, false);
            if ctx.failed_groups.is_empty() {
                info!(operation = %ctx.id(), version, "Operation committed");
                Ok(OperationResult::success(result))
            } else {
                let description = describe_failures(ctx);
                warn!(operation = %ctx.id(), version, failures = %description, "Operation committed with runtime failures");
                Ok(OperationResult::failed(result, description))
            }
        }
        Err(err) => {
            error!(operation = %ctx.id(), error = %err, "Commit failed, undoing runtime changes");
            unwind_all(ctx).await;
            let result = finish_result(ctx, true);
            Ok(OperationResult::failed(result, err.to_string()))
        }
    }
}

async fn roll_back(ctx: &mut OperationContext, err: OperationError) -> Terminal {
    ctx.active.set_status(ExecutionStatus::RollingBack);
    info!(operation = %ctx.id(), error = %err, "Rolling back operation");

    ctx.overlay.discard();
    unwind_all(ctx).await;
    let result = finish_result(ctx, true);

    if let OperationError::Contract(violation) = err {
        error!(operation = %ctx.id(), %violation, "Handler contract violation");
        ctx.active.set_status(ExecutionStatus::Completed);
        return Err(ExecutionError::Contract(violation));
    }

    match ctx.active.cancel_request() {
        Some(request) if request.source == CancelSource::Management || err == OperationError::Cancelled => {
            ctx.active.set_status(ExecutionStatus::Cancelled);
            info!(operation = %ctx.id(), source = ?request.source, "Operation cancelled");
            let response = OperationResult::cancelled(result, "Operation cancelled");
            if request.source == CancelSource::Management && request.status == ExecutionStatus::Executing {
                Ok(response)
            } else {
                Err(ExecutionError::Cancelled(response))
            }
        }
        _ => {
            ctx.active.set_status(ExecutionStatus::Completed);
            Ok(OperationResult::failed(result, err.to_string()))
        }
    }
}

async fn unwind_all(ctx: &mut OperationContext) {
    let journal = std::mem::take(&mut ctx.journal);
    let failures = scheduler::unwind(
        journal,
        Arc::clone(&ctx.shared.services),
        ctx.shared.config.rollback_stability_timeout,
    )
    .await;
    if !failures.is_empty() {
        warn!(operation = %ctx.id(), failures = failures.len(), "Rollback finished with failures");
    }
}

/// Take the accumulated result, marking composite children.
fn finish_result(ctx: &mut OperationContext, rolled_back: bool) -> ModelValue {
    let mut result = std::mem::take(&mut ctx.result);
    if !ctx.composite {
        return result;
    }

    for (group, description) in &ctx.failed_groups {
        let Some(index) = group else { continue };
        if let Some(slot) = result.field_mut(&step_key(*index)) {
            if let Some(outcome) = slot.field_mut("outcome") {
                *outcome = ModelValue::from("failed");
            }
            if let Some(failure) = slot.field_mut("failure-description") {
                *failure = ModelValue::from(description.as_str());
            }
        }
    }

    if rolled_back {
        if let ModelValue::Object(fields) = &mut result {
            for slot in fields.values_mut() {
                if let Some(flag) = slot.field_mut("rolled-back") {
                    *flag = ModelValue::from(true);
                }
            }
        }
    }
    result
}

fn describe_failures(ctx: &OperationContext) -> String {
    ctx.failed_groups
        .iter()
        .map(|(group, description)| match group {
            Some(index) => format!("{}: {}", step_key(*index), description),
            None => description.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_and_overrides() {
        let config: ControllerConfig = serde_json::from_str(r#"{"stability-timeout": 250}"#).unwrap();
        assert_eq!(config.max_concurrent_operations.get(), 16);
        assert_eq!(config.stability_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.rollback_stability_timeout, Duration::from_secs(30));

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["rollback-stability-timeout"], 30_000);
        assert_eq!(json["max-concurrent-operations"], 16);
    }

    #[tokio::test]
    async fn test_registered_handlers_are_dispatched() {
        let controller = ModelController::new();
        let add = Operation::new(crate::global::ADD, Address::root().append("child", "one")).with_param("size", 3);
        assert!(controller.execute(add).await.unwrap().is_success());

        let child = controller.read_resource(&Address::root().append("child", "one")).unwrap();
        assert_eq!(child.attribute("size"), ModelValue::Int(3));
        assert!(controller.active_operations().is_empty());
    }
}
