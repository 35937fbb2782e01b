//! Bridge between runtime steps and the service container.

use crate::rollback::{RollbackAction, ServiceUndo};
use crate::service::{Service, ServiceContainer, ServiceError, ServiceState};
use confman_core::ServiceName;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How waiting for services to settle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability {
    /// No watched service is starting or stopping
    Stable,
    /// A watched service failed to start
    Failed {
        /// Service name
        name: ServiceName,
        /// Reported reason
        reason: String,
    },
    /// The token was cancelled first
    Cancelled,
    /// The timeout elapsed first
    TimedOut,
}

/// Service requests of one operation.
///
/// Each accepted request yields the inverse request as a rollback action,
/// and the requested service is remembered so VERIFY can wait for it.
pub struct ServiceLiaison {
    container: Arc<dyn ServiceContainer>,
    touched: IndexMap<ServiceName, Option<usize>>,
}

impl ServiceLiaison {
    /// Create a liaison over `container`.
    pub fn new(container: Arc<dyn ServiceContainer>) -> Self {
        Self {
            container,
            touched: IndexMap::new(),
        }
    }

    /// The service container.
    pub fn container(&self) -> &Arc<dyn ServiceContainer> {
        &self.container
    }

    /// Services requested so far.
    pub fn touched(&self) -> impl Iterator<Item = &ServiceName> {
        self.touched.keys()
    }

    /// Composite child that requested `name`.
    pub fn group_of(&self, name: &ServiceName) -> Option<usize> {
        self.touched.get(name).copied().flatten()
    }

    /// Stop watching the services requested by `group`.
    pub fn forget_group(&mut self, group: Option<usize>) {
        self.touched.retain(|_, owner| *owner != group);
    }

    fn track(&mut self, name: &ServiceName, group: Option<usize>) {
        self.touched.entry(name.clone()).or_insert(group);
    }

    /// Install and start a service; undone by removing it.
    pub fn install(
        &mut self,
        group: Option<usize>,
        name: ServiceName,
        service: Arc<dyn Service>,
    ) -> Result<Box<dyn RollbackAction>, ServiceError> {
        self.container.install(name.clone(), service)?;
        self.track(&name, group);
        Ok(Box::new(ServiceUndo::Remove(name)))
    }

    /// Remove a service; undone by installing it again.
    pub fn remove(&mut self, group: Option<usize>, name: ServiceName) -> Result<Box<dyn RollbackAction>, ServiceError> {
        let service = self.container.remove(&name)?;
        self.track(&name, group);
        Ok(Box::new(ServiceUndo::Reinstall(name, service)))
    }

    /// Start a stopped service; undone by stopping it.
    pub fn start(&mut self, group: Option<usize>, name: ServiceName) -> Result<Box<dyn RollbackAction>, ServiceError> {
        self.container.start(&name)?;
        self.track(&name, group);
        Ok(Box::new(ServiceUndo::Stop(name)))
    }

    /// Stop a running service; undone by starting it.
    pub fn stop(&mut self, group: Option<usize>, name: ServiceName) -> Result<Box<dyn RollbackAction>, ServiceError> {
        self.container.stop(&name)?;
        self.track(&name, group);
        Ok(Box::new(ServiceUndo::Start(name)))
    }

    /// Current state of a service.
    pub fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.container.state(name)
    }

    /// Wait until every requested service has settled.
    pub async fn await_stability(&self, token: &CancellationToken, timeout: Option<Duration>) -> Stability {
        let names: Vec<_> = self.touched.keys().cloned().collect();
        await_stable(self.container.as_ref(), &names, token, timeout, true).await
    }
}

/// Wait until none of `names` is starting or stopping.
///
/// With `fail_fast`, a start failure ends the wait at once. Otherwise
/// failed services count as settled.
pub async fn await_stable(
    container: &dyn ServiceContainer,
    names: &[ServiceName],
    token: &CancellationToken,
    timeout: Option<Duration>,
    fail_fast: bool,
) -> Stability {
    if names.is_empty() {
        return Stability::Stable;
    }

    let wait = async {
        let mut changes = container.subscribe();
        loop {
            let mut pending = false;
            for name in names {
                match container.state(name) {
                    Some(ServiceState::StartFailed(reason)) if fail_fast => {
                        return Stability::Failed {
                            name: name.clone(),
                            reason,
                        };
                    }
                    Some(state) if state.is_transitional() => pending = true,
                    _ => {}
                }
            }
            if !pending {
                return Stability::Stable;
            }

            debug!(services = names.len(), "Waiting for services to settle");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Stability::Cancelled,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Stability::Stable;
                    }
                }
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait)
            .await
            .unwrap_or(Stability::TimedOut),
        None => wait.await,
    }
}
