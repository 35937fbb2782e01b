//! The composite operation: ordered children sharing one transaction.

use crate::context::OperationContext;
use crate::error::OperationError;
use crate::step::OperationStepHandler;
use async_trait::async_trait;
use confman_core::{ModelValue, Operation};

/// Result key of the composite child at `index`.
pub(crate) fn step_key(index: usize) -> String {
    format!("step-{}", index + 1)
}

/// Expands a composite into one MODEL step per child.
///
/// Children are queued ahead of anything else in MODEL so they run right
/// after the composite, in declared order, before any RUNTIME step. Each
/// child writes its result to `step-N.result`. Children of a top-level
/// composite form the groups that a runtime failure is attributed to;
/// nested composites stay inside their parent's group.
pub struct CompositeOperationHandler;

#[async_trait]
impl OperationStepHandler for CompositeOperationHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        // Resolve every child first so an unknown name fails before any child runs
        let mut children = Vec::with_capacity(operation.steps.len());
        for child in &operation.steps {
            children.push((ctx.handler(&child.name)?, child.clone()));
        }

        let group = ctx.current_group();
        let base = ctx.current_result_path();

        let result = ctx.result_mut();
        if !result.is_defined() {
            *result = ModelValue::object();
        }
        for index in 0..children.len() {
            if let Some(outcome) = result
                .field_mut(&step_key(index))
                .and_then(|slot| slot.field_mut("outcome"))
            {
                *outcome = ModelValue::from("success");
            }
        }

        for (index, (handler, child)) in children.into_iter().enumerate().rev() {
            let mut path = base.clone();
            path.push(step_key(index));
            path.push("result".to_string());
            ctx.add_child_step_first(handler, child, group.or(Some(index)), path)?;
        }

        ctx.complete_step(None)
    }
}
