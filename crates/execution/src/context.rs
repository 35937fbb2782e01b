//! Per-operation state threaded through every step.

use crate::cancellation::{ActiveOperation, ActiveOperations};
use crate::engine::Shared;
use crate::error::{ContractViolation, OperationError};
use crate::liaison::ServiceLiaison;
use crate::rollback::{RollbackAction, RollbackJournal};
use crate::service::{Service, ServiceState};
use crate::step::{OperationStepHandler, Step, StepQueue};
use confman_core::{Address, ExecutionStatus, ModelValue, Operation, OperationId, Resource, ServiceName, Stage};
use confman_storage::{Acquisition, Overlay, ReadResource};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

static UNDEFINED: ModelValue = ModelValue::Undefined;

/// The step currently being executed.
pub(crate) struct CurrentStep {
    pub(crate) operation: Arc<Operation>,
    pub(crate) group: Option<usize>,
    pub(crate) result_path: Vec<String>,
    pub(crate) completed: bool,
}

/// A tree change made by one step, kept for undoing a single group.
struct ModelEdit {
    group: Option<usize>,
    address: Address,
    before: Option<Arc<Resource>>,
    after: Option<Arc<Resource>>,
}

/// Execution state of one operation, shared by all of its steps.
///
/// Handlers read and change the resource tree, queue further steps and
/// request service changes through this context. Tree changes land in a
/// private overlay that is committed only after VERIFY; service changes are
/// recorded with their inverse in the rollback journal.
pub struct OperationContext {
    pub(crate) shared: Arc<Shared>,
    pub(crate) active: Arc<ActiveOperation>,
    pub(crate) overlay: Overlay,
    pub(crate) queue: StepQueue,
    pub(crate) journal: RollbackJournal,
    pub(crate) liaison: ServiceLiaison,
    pub(crate) stage: Stage,
    pub(crate) result: ModelValue,
    pub(crate) current: Option<CurrentStep>,
    pub(crate) violation: Option<ContractViolation>,
    pub(crate) rollback_on_runtime_failure: bool,
    pub(crate) failed_groups: BTreeMap<Option<usize>, String>,
    pub(crate) composite: bool,
    target: Address,
    created: HashSet<Address>,
    step_edits: Vec<(Address, Option<Arc<Resource>>)>,
    model_edits: Vec<ModelEdit>,
}

impl OperationContext {
    pub(crate) fn new(shared: Arc<Shared>, active: Arc<ActiveOperation>, operation: &Operation) -> Self {
        let overlay = Overlay::new(Arc::clone(&shared.tree));
        let liaison = ServiceLiaison::new(Arc::clone(&shared.services));
        Self {
            shared,
            active,
            overlay,
            queue: StepQueue::new(),
            journal: RollbackJournal::new(),
            liaison,
            stage: Stage::Model,
            result: ModelValue::Undefined,
            current: None,
            violation: None,
            rollback_on_runtime_failure: operation.rolls_back_on_runtime_failure(),
            failed_groups: BTreeMap::new(),
            composite: operation.is_composite(),
            target: operation.address.clone(),
            created: HashSet::new(),
            step_edits: Vec::new(),
            model_edits: Vec::new(),
        }
    }

    /// Operation id.
    pub fn id(&self) -> OperationId {
        self.active.id()
    }

    /// Stage being executed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Current execution status.
    pub fn status(&self) -> ExecutionStatus {
        self.active.status()
    }

    /// Result value of the current step.
    pub fn result(&self) -> &ModelValue {
        let path = self.current.as_ref().map(|c| c.result_path.as_slice()).unwrap_or_default();
        path.iter()
            .try_fold(&self.result, |node, key| node.get(key))
            .unwrap_or(&UNDEFINED)
    }

    /// Mutable result value of the current step.
    pub fn result_mut(&mut self) -> &mut ModelValue {
        let path = self.current.as_ref().map(|c| c.result_path.clone()).unwrap_or_default();
        slot_mut(&mut self.result, &path)
    }

    // ---- resource tree ----

    /// Read a resource, including this operation's own pending changes.
    pub fn read_resource(&self, address: &Address) -> Result<Arc<Resource>, OperationError> {
        Ok(self.overlay.read(address)?)
    }

    /// Lock `address` and return its resource for update.
    ///
    /// Waits in `AwaitingOtherOperation` while an overlapping operation holds
    /// the lock. The first write also locks the submitted operation's own
    /// address, so a composite holds its whole target for its children.
    /// Locks are kept until this operation finishes.
    pub async fn read_resource_for_update(&mut self, address: &Address) -> Result<&mut Resource, OperationError> {
        self.ensure_model_stage()?;
        self.lock(address).await?;
        self.note_edit(address);
        Ok(self.overlay.for_update(address)?)
    }

    /// Create a resource. Fails if it exists or its parent does not.
    pub async fn create_resource(&mut self, address: &Address, resource: Resource) -> Result<&mut Resource, OperationError> {
        self.ensure_model_stage()?;
        self.lock(address).await?;
        if self.created.contains(address) && self.overlay.exists(address) {
            return Err(self.violate(ContractViolation::ResourceAddressedTwice(address.clone())));
        }
        self.note_edit(address);
        let created = self.overlay.create(address, resource)?;
        self.created.insert(address.clone());
        Ok(created)
    }

    /// Remove a resource. Fails if it is missing or has children.
    pub async fn remove_resource(&mut self, address: &Address) -> Result<Arc<Resource>, OperationError> {
        self.ensure_model_stage()?;
        self.lock(address).await?;
        self.note_edit(address);
        Ok(self.overlay.remove(address)?)
    }

    async fn lock(&mut self, address: &Address) -> Result<(), OperationError> {
        let target = self.target.clone();
        self.acquire(&target).await?;
        self.acquire(address).await
    }

    async fn acquire(&mut self, address: &Address) -> Result<(), OperationError> {
        let pending = match self.shared.locks.acquire(self.active.id(), address) {
            Acquisition::AlreadyHeld | Acquisition::Granted => return Ok(()),
            Acquisition::Deadlock => {
                warn!(operation = %self.active.id(), address = %address, "Lock wait would deadlock");
                return Err(OperationError::Deadlock(address.clone()));
            }
            Acquisition::Queued(pending) => pending,
        };

        debug!(operation = %self.active.id(), address = %address, "Waiting for overlapping operation");
        self.active.set_status(ExecutionStatus::AwaitingOtherOperation);
        let token = self.active.token().clone();
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(OperationError::Cancelled),
            _ = pending.wait() => {
                self.active.set_status(ExecutionStatus::Executing);
                Ok(())
            }
        }
    }

    /// Remember `address` as it was before the current step first changed it.
    fn note_edit(&mut self, address: &Address) {
        if self.rollback_on_runtime_failure || self.step_edits.iter().any(|(noted, _)| noted == address) {
            return;
        }
        let before = self.overlay.read(address).ok();
        self.step_edits.push((address.clone(), before));
    }

    /// Attribute the current step's tree changes to `group`.
    pub(crate) fn seal_edits(&mut self, group: Option<usize>) {
        for (address, before) in std::mem::take(&mut self.step_edits) {
            let after = self.overlay.read(&address).ok();
            self.model_edits.push(ModelEdit {
                group,
                address,
                before,
                after,
            });
        }
    }

    /// Undo the pending tree changes of one group, newest first.
    pub(crate) fn revert_edits(&mut self, group: Option<usize>) {
        let (reverted, kept) = std::mem::take(&mut self.model_edits)
            .into_iter()
            .partition::<Vec<_>, _>(|edit| edit.group == group);
        self.model_edits = kept;

        for edit in reverted.into_iter().rev() {
            if let Err(err) = self
                .overlay
                .revert(&edit.address, edit.before.as_deref(), edit.after.as_deref())
            {
                warn!(operation = %self.active.id(), address = %edit.address, error = %err, "Could not undo tree change");
            }
        }
    }

    // ---- steps ----

    /// Queue a step for the current operation at `stage`.
    pub fn add_step(&mut self, stage: Stage, handler: Arc<dyn OperationStepHandler>) -> Result<(), OperationError> {
        let step = self.dynamic_step(stage, handler, None)?;
        self.queue.push(step);
        Ok(())
    }

    /// Queue a step for another operation at `stage`.
    pub fn add_step_for(
        &mut self,
        stage: Stage,
        handler: Arc<dyn OperationStepHandler>,
        operation: Operation,
    ) -> Result<(), OperationError> {
        let step = self.dynamic_step(stage, handler, Some(Arc::new(operation)))?;
        self.queue.push(step);
        Ok(())
    }

    /// Queue a step ahead of every step already queued for `stage`.
    pub fn add_step_first(&mut self, stage: Stage, handler: Arc<dyn OperationStepHandler>) -> Result<(), OperationError> {
        let step = self.dynamic_step(stage, handler, None)?;
        self.queue.push_front(step);
        Ok(())
    }

    /// Queue a composite child ahead of the stage's queued steps.
    pub(crate) fn add_child_step_first(
        &mut self,
        handler: Arc<dyn OperationStepHandler>,
        operation: Operation,
        group: Option<usize>,
        result_path: Vec<String>,
    ) -> Result<(), OperationError> {
        let mut step = self.dynamic_step(Stage::Model, handler, Some(Arc::new(operation)))?;
        step.group = group;
        step.result_path = result_path;
        self.queue.push_front(step);
        Ok(())
    }

    fn dynamic_step(
        &mut self,
        stage: Stage,
        handler: Arc<dyn OperationStepHandler>,
        operation: Option<Arc<Operation>>,
    ) -> Result<Step, OperationError> {
        if stage < self.stage || stage == Stage::Done {
            return Err(self.violate(ContractViolation::EarlierStage {
                requested: stage,
                current: self.stage,
            }));
        }
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| OperationError::failed("steps can only be added while a step runs"))?;
        Ok(Step {
            operation: operation.unwrap_or_else(|| Arc::clone(&current.operation)),
            handler,
            stage,
            dynamic: true,
            group: current.group,
            result_path: current.result_path.clone(),
        })
    }

    /// Mark the current step complete, with an optional rollback action.
    pub fn complete_step(&mut self, rollback: Option<Box<dyn RollbackAction>>) -> Result<(), OperationError> {
        let Some(current) = self.current.as_mut() else {
            return Err(OperationError::failed("complete_step called outside a step"));
        };
        if current.completed {
            let operation = current.operation.name.clone();
            return Err(self.violate(ContractViolation::StepCompletedTwice { operation }));
        }
        current.completed = true;
        if let Some(action) = rollback {
            self.journal.record(current.group, current.operation.name.clone(), action);
        }
        Ok(())
    }

    // ---- cancellation ----

    /// Fail with `Cancelled` if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), OperationError> {
        if self.active.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run blocking handler logic so that cancellation interrupts it.
    ///
    /// An interrupted call yields [`OperationError::Interrupted`]. A handler
    /// that propagates it as is reports an unexpected failure; one that has
    /// nothing to clean up may map it to [`OperationError::Cancelled`].
    pub fn interruptible<F>(&self, fut: F) -> impl Future<Output = Result<F::Output, OperationError>>
    where
        F: Future,
    {
        let token = self.active.token().clone();
        async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(OperationError::Interrupted),
                output = fut => Ok(output),
            }
        }
    }

    // ---- services ----

    /// Install and start a service.
    pub fn install_service(&mut self, name: ServiceName, service: Arc<dyn Service>) -> Result<(), OperationError> {
        self.ensure_runtime_stage()?;
        let group = self.current_group();
        let undo = self.liaison.install(group, name.clone(), service)?;
        self.journal.record(group, format!("install {}", name), undo);
        Ok(())
    }

    /// Stop and remove a service.
    pub fn remove_service(&mut self, name: ServiceName) -> Result<(), OperationError> {
        self.ensure_runtime_stage()?;
        let group = self.current_group();
        let undo = self.liaison.remove(group, name.clone())?;
        self.journal.record(group, format!("remove {}", name), undo);
        Ok(())
    }

    /// Start a stopped service.
    pub fn start_service(&mut self, name: ServiceName) -> Result<(), OperationError> {
        self.ensure_runtime_stage()?;
        let group = self.current_group();
        let undo = self.liaison.start(group, name.clone())?;
        self.journal.record(group, format!("start {}", name), undo);
        Ok(())
    }

    /// Stop a running service.
    pub fn stop_service(&mut self, name: ServiceName) -> Result<(), OperationError> {
        self.ensure_runtime_stage()?;
        let group = self.current_group();
        let undo = self.liaison.stop(group, name.clone())?;
        self.journal.record(group, format!("stop {}", name), undo);
        Ok(())
    }

    /// Current state of a service, `None` when not installed.
    pub fn service_state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.liaison.state(name)
    }

    // ---- registry and introspection ----

    /// Handler registered for `name`.
    pub fn handler(&self, name: &str) -> Result<Arc<dyn OperationStepHandler>, OperationError> {
        self.shared.registry.read().require(name)
    }

    /// In-flight operations.
    pub fn active_operations(&self) -> &ActiveOperations {
        &self.shared.active
    }

    // ---- internals ----

    pub(crate) fn current_group(&self) -> Option<usize> {
        self.current.as_ref().and_then(|c| c.group)
    }

    pub(crate) fn current_result_path(&self) -> Vec<String> {
        self.current
            .as_ref()
            .map(|c| c.result_path.clone())
            .unwrap_or_default()
    }

    fn ensure_model_stage(&mut self) -> Result<(), OperationError> {
        if self.stage == Stage::Model {
            Ok(())
        } else {
            Err(self.violate(ContractViolation::ModelOutsideModelStage { stage: self.stage }))
        }
    }

    fn ensure_runtime_stage(&mut self) -> Result<(), OperationError> {
        if self.stage == Stage::Runtime {
            Ok(())
        } else {
            Err(self.violate(ContractViolation::ServiceOutsideRuntime { stage: self.stage }))
        }
    }

    /// Remember a contract violation so it survives a handler swallowing it.
    pub(crate) fn violate(&mut self, violation: ContractViolation) -> OperationError {
        self.violation.get_or_insert_with(|| violation.clone());
        OperationError::Contract(violation)
    }
}

/// Walk `path` inside `root`, creating objects along the way.
pub(crate) fn slot_mut<'a>(mut node: &'a mut ModelValue, path: &[String]) -> &'a mut ModelValue {
    for key in path {
        if node.as_object().is_none() {
            *node = ModelValue::object();
        }
        let ModelValue::Object(fields) = node else {
            unreachable!("node was just made an object");
        };
        node = fields.entry(key.clone()).or_default();
    }
    node
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_mut_builds_nested_objects() {
        let mut result = ModelValue::Undefined;
        let path = vec!["step-1".to_string(), "result".to_string()];
        *slot_mut(&mut result, &path) = ModelValue::from(1);

        assert_eq!(
            result.get("step-1").and_then(|s| s.get("result")),
            Some(&ModelValue::Int(1))
        );

        // A scalar in the way is replaced
        let mut scalar = ModelValue::from(3);
        *slot_mut(&mut scalar, &path[..1]) = ModelValue::from(true);
        assert_eq!(scalar.get("step-1"), Some(&ModelValue::Boolean(true)));
    }
}
