//! Drives an operation's steps through MODEL, RUNTIME and VERIFY.

use crate::context::{CurrentStep, OperationContext};
use crate::error::{ContractViolation, OperationError};
use crate::liaison::{await_stable, Stability};
use crate::rollback::{RollbackContext, RollbackJournal};
use crate::service::{ServiceContainer, ServiceError};
use crate::step::Step;
use confman_core::{ExecutionStatus, Stage};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Run every queued step, stage by stage.
///
/// Steps of one stage run in queue order, and steps they add run in the
/// same pass. Entering VERIFY first waits for the services requested in
/// RUNTIME to settle. Returns once the pipeline reaches `Done`; committing
/// or rolling back is up to the caller.
pub(crate) async fn run(ctx: &mut OperationContext) -> Result<(), OperationError> {
    for stage in Stage::EXECUTABLE {
        ctx.stage = stage;
        debug!(operation = %ctx.id(), stage = %stage, "Entering stage");

        if stage == Stage::Verify {
            await_stability(ctx).await?;
        }

        while let Some(step) = ctx.queue.pop(stage) {
            ctx.check_cancelled()?;
            if ctx.failed_groups.contains_key(&step.group) {
                debug!(operation = %ctx.id(), group = ?step.group, "Skipping step of failed group");
                continue;
            }

            let group = step.group;
            if let Err(err) = run_step(ctx, step).await {
                if tolerates(ctx, stage, &err) {
                    undo_group(ctx, group, err.to_string()).await;
                } else {
                    ctx.failed_groups.entry(group).or_insert_with(|| err.to_string());
                    return Err(err);
                }
            }
        }
    }

    ctx.stage = Stage::Done;
    Ok(())
}

async fn run_step(ctx: &mut OperationContext, step: Step) -> Result<(), OperationError> {
    debug!(
        operation = %ctx.id(),
        step = %step.operation.name,
        stage = %step.stage,
        dynamic = step.dynamic,
        "Executing step"
    );

    ctx.current = Some(CurrentStep {
        operation: Arc::clone(&step.operation),
        group: step.group,
        result_path: step.result_path.clone(),
        completed: false,
    });
    let outcome = step.handler.execute(ctx, &step.operation).await;
    ctx.seal_edits(step.group);
    let completed = ctx.current.take().is_some_and(|current| current.completed);

    if let Some(violation) = ctx.violation.clone() {
        return Err(OperationError::Contract(violation));
    }
    outcome?;
    if !completed {
        return Err(ctx.violate(ContractViolation::StepNotCompleted {
            operation: step.operation.name.clone(),
        }));
    }
    Ok(())
}

/// Whether a failure stays local to its group instead of failing the
/// whole operation.
fn tolerates(ctx: &OperationContext, stage: Stage, err: &OperationError) -> bool {
    !ctx.rollback_on_runtime_failure
        && stage != Stage::Model
        && !ctx.active.is_cancelled()
        && !matches!(
            err,
            OperationError::Contract(_) | OperationError::Cancelled | OperationError::Interrupted
        )
}

/// Undo what one group changed, keeping every other group's changes.
async fn undo_group(ctx: &mut OperationContext, group: Option<usize>, description: String) {
    warn!(operation = %ctx.id(), ?group, error = %description, "Runtime failure, undoing the failed step only");
    ctx.revert_edits(group);
    let journal = ctx.journal.take_group(group);
    unwind(
        journal,
        Arc::clone(&ctx.shared.services),
        ctx.shared.config.rollback_stability_timeout,
    )
    .await;
    ctx.liaison.forget_group(group);
    ctx.failed_groups.insert(group, description);
}

/// Block in `AwaitingStability` until the requested services settle.
async fn await_stability(ctx: &mut OperationContext) -> Result<(), OperationError> {
    loop {
        if ctx.liaison.touched().next().is_none() {
            return Ok(());
        }

        ctx.active.set_status(ExecutionStatus::AwaitingStability);
        let token = ctx.active.token().clone();
        let stability = ctx
            .liaison
            .await_stability(&token, ctx.shared.config.stability_timeout)
            .await;

        match stability {
            Stability::Stable => {
                ctx.active.set_status(ExecutionStatus::Executing);
                return Ok(());
            }
            Stability::Cancelled => return Err(OperationError::Cancelled),
            Stability::TimedOut => return Err(ServiceError::Timeout.into()),
            Stability::Failed { name, reason } => {
                let group = ctx.liaison.group_of(&name);
                let err = OperationError::from(ServiceError::StartFailed { name, reason });
                if !tolerates(ctx, Stage::Verify, &err) {
                    ctx.failed_groups.entry(group).or_insert_with(|| err.to_string());
                    return Err(err);
                }
                ctx.active.set_status(ExecutionStatus::Executing);
                undo_group(ctx, group, err.to_string()).await;
            }
        }
    }
}

/// Run a journal in reverse and wait, bounded, for its service changes.
pub(crate) async fn unwind(journal: RollbackJournal, services: Arc<dyn ServiceContainer>, timeout: Duration) -> Vec<String> {
    if journal.is_empty() {
        return Vec::new();
    }

    let mut rollback = RollbackContext::new(services);
    let failures = journal.unwind(&mut rollback).await;

    let stability = await_stable(
        rollback.services().as_ref(),
        rollback.touched(),
        &CancellationToken::new(),
        Some(timeout),
        false,
    )
    .await;
    if stability == Stability::TimedOut {
        warn!(services = rollback.touched().len(), "Services did not settle after rollback");
    }
    failures
}
