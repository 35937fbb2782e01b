//! Recorded undo actions and their reverse-order unwinding.

use crate::error::OperationError;
use crate::service::{Service, ServiceContainer, ServiceError};
use async_trait::async_trait;
use confman_core::ServiceName;
use std::sync::Arc;
use tracing::{debug, warn};

/// Inverse of one committed change.
#[async_trait]
pub trait RollbackAction: Send {
    /// Undo the change.
    async fn rollback(self: Box<Self>, ctx: &mut RollbackContext) -> Result<(), OperationError>;
}

/// Wrap a closure as a rollback action.
pub fn rollback_fn<F>(f: F) -> Box<dyn RollbackAction>
where
    F: FnOnce(&mut RollbackContext) -> Result<(), OperationError> + Send + 'static,
{
    Box::new(FnRollback(f))
}

struct FnRollback<F>(F);

#[async_trait]
impl<F> RollbackAction for FnRollback<F>
where
    F: FnOnce(&mut RollbackContext) -> Result<(), OperationError> + Send + 'static,
{
    async fn rollback(self: Box<Self>, ctx: &mut RollbackContext) -> Result<(), OperationError> {
        (self.0)(ctx)
    }
}

/// What rollback actions may act on.
///
/// Service changes made here are tracked so that the unwind can wait for
/// them to settle.
pub struct RollbackContext {
    services: Arc<dyn ServiceContainer>,
    touched: Vec<ServiceName>,
}

impl RollbackContext {
    /// Create a context over `services`.
    pub fn new(services: Arc<dyn ServiceContainer>) -> Self {
        Self {
            services,
            touched: Vec::new(),
        }
    }

    /// Services changed during the unwind.
    pub fn touched(&self) -> &[ServiceName] {
        &self.touched
    }

    /// The service container.
    pub fn services(&self) -> &Arc<dyn ServiceContainer> {
        &self.services
    }

    /// Install and start a service.
    pub fn install_service(&mut self, name: ServiceName, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        self.touched.push(name.clone());
        self.services.install(name, service)
    }

    /// Remove a service.
    pub fn remove_service(&mut self, name: &ServiceName) -> Result<Arc<dyn Service>, ServiceError> {
        self.touched.push(name.clone());
        self.services.remove(name)
    }

    /// Start a stopped service.
    pub fn start_service(&mut self, name: &ServiceName) -> Result<(), ServiceError> {
        self.touched.push(name.clone());
        self.services.start(name)
    }

    /// Stop a running service.
    pub fn stop_service(&mut self, name: &ServiceName) -> Result<(), ServiceError> {
        self.touched.push(name.clone());
        self.services.stop(name)
    }
}

/// One journal entry.
pub struct RollbackEntry {
    /// Index of the top-level composite child that recorded it
    pub group: Option<usize>,
    /// What recorded it, for logs
    pub label: String,
    action: Box<dyn RollbackAction>,
}

/// Ordered list of rollback actions of one operation.
#[derive(Default)]
pub struct RollbackJournal {
    entries: Vec<RollbackEntry>,
}

impl RollbackJournal {
    /// Create an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. Actions are undone last-in first-out.
    pub fn record(&mut self, group: Option<usize>, label: impl Into<String>, action: Box<dyn RollbackAction>) {
        self.entries.push(RollbackEntry {
            group,
            label: label.into(),
            action,
        });
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move out the actions recorded by `group`, keeping their order.
    pub fn take_group(&mut self, group: Option<usize>) -> RollbackJournal {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| entry.group == group);
        self.entries = kept;
        RollbackJournal { entries: taken }
    }

    /// Run every action in reverse order of recording.
    ///
    /// A failing action is logged and the unwind continues. Returns the
    /// descriptions of the failures.
    pub async fn unwind(self, ctx: &mut RollbackContext) -> Vec<String> {
        let mut failures = Vec::new();
        for entry in self.entries.into_iter().rev() {
            debug!(label = %entry.label, "Running rollback action");
            if let Err(err) = entry.action.rollback(ctx).await {
                warn!(label = %entry.label, error = %err, "Rollback action failed");
                failures.push(format!("{}: {}", entry.label, err));
            }
        }
        failures
    }
}

/// Inverse of a service change made through the liaison.
pub(crate) enum ServiceUndo {
    Remove(ServiceName),
    Reinstall(ServiceName, Arc<dyn Service>),
    Start(ServiceName),
    Stop(ServiceName),
}

#[async_trait]
impl RollbackAction for ServiceUndo {
    async fn rollback(self: Box<Self>, ctx: &mut RollbackContext) -> Result<(), OperationError> {
        match *self {
            ServiceUndo::Remove(name) => ctx.remove_service(&name).map(|_| ())?,
            ServiceUndo::Reinstall(name, service) => ctx.install_service(name, service)?,
            ServiceUndo::Start(name) => ctx.start_service(&name)?,
            ServiceUndo::Stop(name) => ctx.stop_service(&name)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::InMemoryServiceContainer;
    use parking_lot::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> Box<dyn RollbackAction> {
        let log = Arc::clone(log);
        let name = name.to_string();
        rollback_fn(move |_| {
            log.lock().push(name);
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_unwinds_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut journal = RollbackJournal::new();
        for name in ["r1", "r2", "r3"] {
            journal.record(None, name, recorder(&log, name));
        }

        let mut ctx = RollbackContext::new(Arc::new(InMemoryServiceContainer::new()));
        let failures = journal.unwind(&mut ctx).await;

        assert!(failures.is_empty());
        assert_eq!(*log.lock(), vec!["r3", "r2", "r1"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_unwind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut journal = RollbackJournal::new();
        journal.record(None, "r1", recorder(&log, "r1"));
        journal.record(None, "broken", rollback_fn(|_| Err(OperationError::failed("boom"))));

        let mut ctx = RollbackContext::new(Arc::new(InMemoryServiceContainer::new()));
        let failures = journal.unwind(&mut ctx).await;

        assert_eq!(failures, vec!["broken: boom".to_string()]);
        assert_eq!(*log.lock(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_take_group() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut journal = RollbackJournal::new();
        journal.record(Some(0), "a", recorder(&log, "a"));
        journal.record(Some(1), "b1", recorder(&log, "b1"));
        journal.record(Some(1), "b2", recorder(&log, "b2"));

        let group = journal.take_group(Some(1));
        assert_eq!(group.len(), 2);
        assert_eq!(journal.len(), 1);

        let mut ctx = RollbackContext::new(Arc::new(InMemoryServiceContainer::new()));
        group.unwind(&mut ctx).await;
        assert_eq!(*log.lock(), vec!["b2", "b1"]);
    }

    #[tokio::test]
    async fn test_service_undo_tracks_touched() {
        let container = Arc::new(InMemoryServiceContainer::new());
        let name = ServiceName::of("jboss").append("good-service");
        container.install(name.clone(), Arc::new(crate::service::NoopService)).unwrap();

        let mut journal = RollbackJournal::new();
        journal.record(None, "install", Box::new(ServiceUndo::Remove(name.clone())));
        let mut ctx = RollbackContext::new(container.clone());
        assert!(journal.unwind(&mut ctx).await.is_empty());

        assert_eq!(ctx.touched(), &[name.clone()]);
        assert_eq!(container.state(&name), None);
    }
}
