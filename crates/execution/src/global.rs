//! Operations available on every controller.

use crate::cancellation::CancelSource;
use crate::composite::CompositeOperationHandler;
use crate::context::OperationContext;
use crate::error::OperationError;
use crate::service::ServiceState;
use crate::step::{HandlerRegistry, OperationStepHandler};
use async_trait::async_trait;
use confman_core::{
    Capability, ModelValue, Operation, Resource, ServiceName, Stage, ACTIVE_OPERATION, COMPOSITE,
};
use confman_storage::StorageError;
use std::collections::BTreeMap;
use std::sync::Arc;

/// `read-resource`
pub const READ_RESOURCE: &str = "read-resource";
/// `read-attribute`
pub const READ_ATTRIBUTE: &str = "read-attribute";
/// `write-attribute`
pub const WRITE_ATTRIBUTE: &str = "write-attribute";
/// `undefine-attribute`
pub const UNDEFINE_ATTRIBUTE: &str = "undefine-attribute";
/// `read-children-resources`
pub const READ_CHILDREN_RESOURCES: &str = "read-children-resources";
/// `add`
pub const ADD: &str = "add";
/// `remove`
pub const REMOVE: &str = "remove";
/// `cancel`, on `active-operation=<id>`
pub const CANCEL: &str = "cancel";
/// `read-service-state`
pub const READ_SERVICE_STATE: &str = "read-service-state";

/// Register the global operations and `composite`.
pub fn register_global_operations(registry: &mut HandlerRegistry) {
    registry.register(READ_RESOURCE, Arc::new(ReadResourceHandler));
    registry.register(READ_ATTRIBUTE, Arc::new(ReadAttributeHandler));
    registry.register(WRITE_ATTRIBUTE, Arc::new(WriteAttributeHandler));
    registry.register(UNDEFINE_ATTRIBUTE, Arc::new(UndefineAttributeHandler));
    registry.register(READ_CHILDREN_RESOURCES, Arc::new(ReadChildrenResourcesHandler));
    registry.register(ADD, Arc::new(AddHandler));
    registry.register(REMOVE, Arc::new(RemoveHandler));
    registry.register(CANCEL, Arc::new(CancelHandler));
    registry.register(READ_SERVICE_STATE, Arc::new(ReadServiceStateHandler));
    registry.register(COMPOSITE, Arc::new(CompositeOperationHandler));
}

fn string_param<'a>(operation: &'a Operation, name: &str) -> Result<&'a str, OperationError> {
    operation
        .require(name)?
        .as_str()
        .ok_or_else(|| OperationError::validation(format!("parameter '{}' must be a string", name)))
}

fn flag_param(operation: &Operation, name: &str) -> bool {
    operation.param(name).and_then(ModelValue::as_bool).unwrap_or(false)
}

/// Reads a resource, or an in-flight operation under `active-operation`.
pub struct ReadResourceHandler;

#[async_trait]
impl OperationStepHandler for ReadResourceHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let value = match ctx.active_operations().resolve(&operation.address) {
            Some(active) => active.to_model(),
            None => ctx
                .read_resource(&operation.address)?
                .to_value(flag_param(operation, "recursive")),
        };
        *ctx.result_mut() = value;
        ctx.complete_step(None)
    }
}

/// Reads one attribute.
pub struct ReadAttributeHandler;

#[async_trait]
impl OperationStepHandler for ReadAttributeHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let name = string_param(operation, "name")?;
        let value = match ctx.active_operations().resolve(&operation.address) {
            Some(active) => active.to_model().get(name).cloned().unwrap_or_default(),
            None => ctx.read_resource(&operation.address)?.attribute(name),
        };
        *ctx.result_mut() = value;
        ctx.complete_step(None)
    }
}

/// Sets one attribute; the result is the previous value.
pub struct WriteAttributeHandler;

#[async_trait]
impl OperationStepHandler for WriteAttributeHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let name = string_param(operation, "name")?;
        let value = operation.params.get("value").cloned().unwrap_or_default();
        let resource = ctx.read_resource_for_update(&operation.address).await?;
        let previous = if value.is_defined() {
            resource.set_attribute(name, value)
        } else {
            resource.model_mut().remove(name).unwrap_or_default()
        };
        *ctx.result_mut() = previous;
        ctx.complete_step(None)
    }
}

/// Clears one attribute; the result is the previous value.
pub struct UndefineAttributeHandler;

#[async_trait]
impl OperationStepHandler for UndefineAttributeHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let name = string_param(operation, "name")?;
        let resource = ctx.read_resource_for_update(&operation.address).await?;
        let previous = resource.model_mut().remove(name).unwrap_or_default();
        *ctx.result_mut() = previous;
        ctx.complete_step(None)
    }
}

/// Lists the children of one type, fully rendered.
///
/// With `child-type` `active-operation` it lists the in-flight operations.
pub struct ReadChildrenResourcesHandler;

#[async_trait]
impl OperationStepHandler for ReadChildrenResourcesHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let child_type = string_param(operation, "child-type")?;
        let children: BTreeMap<String, ModelValue> = if child_type == ACTIVE_OPERATION && operation.address.is_root() {
            ctx.active_operations()
                .list()
                .into_iter()
                .map(|active| (active.id().to_string(), active.to_model()))
                .collect()
        } else {
            ctx.read_resource(&operation.address)?
                .children(child_type)
                .map(|(name, child)| (name.to_string(), child.to_value(true)))
                .collect()
        };
        *ctx.result_mut() = ModelValue::Object(children);
        ctx.complete_step(None)
    }
}

/// Creates the target resource with the parameters as attributes.
pub struct AddHandler;

#[async_trait]
impl OperationStepHandler for AddHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let model = operation
            .params
            .iter()
            .filter(|(_, value)| value.is_defined())
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        ctx.create_resource(&operation.address, Resource::with_model(model)).await?;
        ctx.complete_step(None)
    }
}

/// Removes the target resource.
pub struct RemoveHandler;

#[async_trait]
impl OperationStepHandler for RemoveHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        ctx.remove_resource(&operation.address).await?;
        ctx.complete_step(None)
    }
}

/// Cancels the in-flight operation at `active-operation=<id>`.
///
/// The result is whether the request was accepted.
pub struct CancelHandler;

#[async_trait]
impl OperationStepHandler for CancelHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let target = ctx
            .active_operations()
            .resolve(&operation.address)
            .ok_or_else(|| StorageError::NotFound(operation.address.clone()))?;
        let accepted = target.id() != ctx.id() && target.request_cancel(CancelSource::Management);
        *ctx.result_mut() = ModelValue::from(accepted);
        ctx.complete_step(None)
    }
}

/// Reports a service's state from RUNTIME.
///
/// The service is named by `service`, or by `capability` plus `name`. A
/// service that is not up yields an undefined result rather than a failure.
pub struct ReadServiceStateHandler;

#[async_trait]
impl OperationStepHandler for ReadServiceStateHandler {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        service_name(operation)?;
        ctx.add_step(Stage::Runtime, Arc::new(ServiceStateQuery))?;
        ctx.complete_step(None)
    }
}

struct ServiceStateQuery;

#[async_trait]
impl OperationStepHandler for ServiceStateQuery {
    async fn execute(&self, ctx: &mut OperationContext, operation: &Operation) -> Result<(), OperationError> {
        let name = service_name(operation)?;
        *ctx.result_mut() = match ctx.service_state(&name) {
            Some(state @ ServiceState::Up) => ModelValue::from(state.to_string()),
            _ => ModelValue::Undefined,
        };
        ctx.complete_step(None)
    }
}

fn service_name(operation: &Operation) -> Result<ServiceName, OperationError> {
    if let Some(service) = operation.param("service") {
        return service
            .as_str()
            .map(ServiceName::of)
            .ok_or_else(|| OperationError::validation("parameter 'service' must be a string"));
    }
    let capability = Capability::new(string_param(operation, "capability")?);
    Ok(capability.service_name(string_param(operation, "name")?))
}
