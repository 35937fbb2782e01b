//! Steps, the per-stage step queue and the handler registry.

use crate::context::OperationContext;
use crate::error::OperationError;
use async_trait::async_trait;
use confman_core::{Operation, Stage};
use indexmap::IndexMap;
use std::collections::VecDeque;
use std::sync::Arc;

/// Handler for one step of an operation.
///
/// A handler must call [`OperationContext::complete_step`] exactly once
/// before returning `Ok`.
#[async_trait]
pub trait OperationStepHandler: Send + Sync {
    /// Execute the step.
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError>;
}

/// One unit of pipeline work.
#[derive(Clone)]
pub struct Step {
    pub(crate) operation: Arc<Operation>,
    pub(crate) handler: Arc<dyn OperationStepHandler>,
    pub(crate) stage: Stage,
    pub(crate) dynamic: bool,
    pub(crate) group: Option<usize>,
    pub(crate) result_path: Vec<String>,
}

impl Step {
    /// The submitted operation's first step.
    pub(crate) fn initial(operation: Arc<Operation>, handler: Arc<dyn OperationStepHandler>) -> Self {
        Self {
            operation,
            handler,
            stage: Stage::Model,
            dynamic: false,
            group: None,
            result_path: Vec::new(),
        }
    }

    /// Operation the step runs for.
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    /// Stage the step runs in.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Whether another step added this one.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Index of the top-level composite child this step belongs to.
    pub fn group(&self) -> Option<usize> {
        self.group
    }
}

/// Pending steps of one operation, one FIFO per stage.
#[derive(Default)]
pub struct StepQueue {
    queues: [VecDeque<Step>; 3],
}

impl StepQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(stage: Stage) -> Option<usize> {
        match stage {
            Stage::Model => Some(0),
            Stage::Runtime => Some(1),
            Stage::Verify => Some(2),
            Stage::Done => None,
        }
    }

    /// Append a step to its stage.
    pub fn push(&mut self, step: Step) {
        if let Some(slot) = Self::slot(step.stage) {
            self.queues[slot].push_back(step);
        }
    }

    /// Put a step ahead of everything queued for its stage.
    pub fn push_front(&mut self, step: Step) {
        if let Some(slot) = Self::slot(step.stage) {
            self.queues[slot].push_front(step);
        }
    }

    /// Take the next step of `stage`.
    pub fn pop(&mut self, stage: Stage) -> Option<Step> {
        Self::slot(stage).and_then(|slot| self.queues[slot].pop_front())
    }

    /// Number of steps queued for `stage`.
    pub fn len(&self, stage: Stage) -> usize {
        Self::slot(stage).map_or(0, |slot| self.queues[slot].len())
    }

    /// Whether no step is queued.
    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }
}

/// Operation handlers by name.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: IndexMap<String, Arc<dyn OperationStepHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for `name`.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn OperationStepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    /// Remove a handler.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn OperationStepHandler>> {
        self.handlers.shift_remove(name)
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<Arc<dyn OperationStepHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Registered operation names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Look up a handler, failing validation for unknown names.
    pub fn require(&self, name: &str) -> Result<Arc<dyn OperationStepHandler>, OperationError> {
        self.get(name)
            .ok_or_else(|| OperationError::validation(format!("No handler for operation '{}'", name)))
    }
}
