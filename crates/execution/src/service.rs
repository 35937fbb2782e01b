//! The external service container and an in-process implementation.

use async_trait::async_trait;
use confman_core::ServiceName;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lifecycle state of an installed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Start in progress
    Starting,
    /// Running
    Up,
    /// Start failed with a reason
    StartFailed(String),
    /// Stop in progress
    Stopping,
    /// Installed but stopped
    Down,
}

impl ServiceState {
    /// Whether the service is between two settled states.
    pub fn is_transitional(&self) -> bool {
        matches!(self, ServiceState::Starting | ServiceState::Stopping)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Starting => write!(f, "STARTING"),
            ServiceState::Up => write!(f, "UP"),
            ServiceState::StartFailed(_) => write!(f, "START_FAILED"),
            ServiceState::Stopping => write!(f, "STOPPING"),
            ServiceState::Down => write!(f, "DOWN"),
        }
    }
}

/// Errors reported by a service container.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// A service with that name is already installed
    #[error("Service {0} is already installed")]
    Duplicate(ServiceName),

    /// No service with that name
    #[error("Service {0} is not installed")]
    NotInstalled(ServiceName),

    /// Request not valid in the current state
    #[error("Service {name} cannot be changed while {state}")]
    InvalidState {
        /// Service name
        name: ServiceName,
        /// Current state
        state: ServiceState,
    },

    /// The service failed to start
    #[error("Service {name} failed to start: {reason}")]
    StartFailed {
        /// Service name
        name: ServiceName,
        /// Reported reason
        reason: String,
    },

    /// Services did not settle in time
    #[error("Services did not reach a stable state in time")]
    Timeout,
}

/// A runtime service managed by the container.
#[async_trait]
pub trait Service: Send + Sync {
    /// Start the service.
    async fn start(&self) -> Result<(), String>;

    /// Stop the service.
    async fn stop(&self) {}
}

/// A service with no behavior of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopService;

#[async_trait]
impl Service for NoopService {
    async fn start(&self) -> Result<(), String> {
        Ok(())
    }
}

/// The asynchronous service container the engine acts on.
///
/// Requests return as soon as they are accepted; progress is published
/// through [`subscribe`](Self::subscribe).
pub trait ServiceContainer: Send + Sync {
    /// Install and start a service.
    fn install(&self, name: ServiceName, service: Arc<dyn Service>) -> Result<(), ServiceError>;

    /// Start a stopped or failed service.
    fn start(&self, name: &ServiceName) -> Result<(), ServiceError>;

    /// Stop a running service, keeping it installed.
    fn stop(&self, name: &ServiceName) -> Result<(), ServiceError>;

    /// Stop and uninstall a service, returning it.
    fn remove(&self, name: &ServiceName) -> Result<Arc<dyn Service>, ServiceError>;

    /// Current state, `None` when not installed.
    fn state(&self, name: &ServiceName) -> Option<ServiceState>;

    /// Change notifications; the value is a change counter.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Service container running start and stop on tokio tasks.
#[derive(Clone)]
pub struct InMemoryServiceContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    services: Mutex<IndexMap<ServiceName, Entry>>,
    changes: watch::Sender<u64>,
}

struct Entry {
    service: Arc<dyn Service>,
    state: ServiceState,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl InMemoryServiceContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(ContainerInner {
                services: Mutex::new(IndexMap::new()),
                changes,
            }),
        }
    }

    /// Names and states of every installed service.
    pub fn services(&self) -> Vec<(ServiceName, ServiceState)> {
        self.inner
            .services
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.state.clone()))
            .collect()
    }

    fn spawn_start(&self, name: ServiceName, entry: &mut Entry) {
        entry.generation += 1;
        entry.state = ServiceState::Starting;
        let generation = entry.generation;
        let service = Arc::clone(&entry.service);
        let inner = Arc::clone(&self.inner);

        entry.task = Some(tokio::spawn(async move {
            let state = match service.start().await {
                Ok(()) => ServiceState::Up,
                Err(reason) => {
                    warn!(service = %name, %reason, "Service failed to start");
                    ServiceState::StartFailed(reason)
                }
            };
            inner.settle(&name, generation, state);
        }));
    }

    fn spawn_stop(&self, name: ServiceName, entry: &mut Entry) {
        entry.generation += 1;
        entry.state = ServiceState::Stopping;
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        let generation = entry.generation;
        let service = Arc::clone(&entry.service);
        let inner = Arc::clone(&self.inner);

        entry.task = Some(tokio::spawn(async move {
            service.stop().await;
            inner.settle(&name, generation, ServiceState::Down);
        }));
    }
}

impl Default for InMemoryServiceContainer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerInner {
    /// Record the end of a start or stop unless a newer request superseded it.
    fn settle(&self, name: &ServiceName, generation: u64, state: ServiceState) {
        let mut services = self.services.lock();
        let Some(entry) = services.get_mut(name) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        debug!(service = %name, state = %state, "Service settled");
        entry.state = state;
        entry.task = None;
        drop(services);
        self.notify();
    }

    fn notify(&self) {
        self.changes.send_modify(|counter| *counter += 1);
    }
}

impl ServiceContainer for InMemoryServiceContainer {
    fn install(&self, name: ServiceName, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let mut services = self.inner.services.lock();
        if services.contains_key(&name) {
            return Err(ServiceError::Duplicate(name));
        }
        debug!(service = %name, "Installing service");
        let mut entry = Entry {
            service,
            state: ServiceState::Down,
            generation: 0,
            task: None,
        };
        self.spawn_start(name.clone(), &mut entry);
        services.insert(name, entry);
        drop(services);
        self.inner.notify();
        Ok(())
    }

    fn start(&self, name: &ServiceName) -> Result<(), ServiceError> {
        let mut services = self.inner.services.lock();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotInstalled(name.clone()))?;
        match entry.state {
            ServiceState::Down | ServiceState::StartFailed(_) => {}
            ref state => {
                return Err(ServiceError::InvalidState {
                    name: name.clone(),
                    state: state.clone(),
                })
            }
        }
        debug!(service = %name, "Starting service");
        self.spawn_start(name.clone(), entry);
        drop(services);
        self.inner.notify();
        Ok(())
    }

    fn stop(&self, name: &ServiceName) -> Result<(), ServiceError> {
        let mut services = self.inner.services.lock();
        let entry = services
            .get_mut(name)
            .ok_or_else(|| ServiceError::NotInstalled(name.clone()))?;
        if entry.state != ServiceState::Up {
            return Err(ServiceError::InvalidState {
                name: name.clone(),
                state: entry.state.clone(),
            });
        }
        debug!(service = %name, "Stopping service");
        self.spawn_stop(name.clone(), entry);
        drop(services);
        self.inner.notify();
        Ok(())
    }

    fn remove(&self, name: &ServiceName) -> Result<Arc<dyn Service>, ServiceError> {
        let mut services = self.inner.services.lock();
        let mut entry = services
            .shift_remove(name)
            .ok_or_else(|| ServiceError::NotInstalled(name.clone()))?;
        drop(services);
        debug!(service = %name, state = %entry.state, "Removing service");

        // An unfinished start is abandoned; its service still gets a stop call
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        let service = Arc::clone(&entry.service);
        let stopping = Arc::clone(&entry.service);
        tokio::spawn(async move {
            stopping.stop().await;
        });

        self.inner.notify();
        Ok(service)
    }

    fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.inner
            .services
            .lock()
            .get(name)
            .map(|entry| entry.state.clone())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FailingService;

    #[async_trait]
    impl Service for FailingService {
        async fn start(&self) -> Result<(), String> {
            Err("port in use".to_string())
        }
    }

    async fn settled(container: &InMemoryServiceContainer, name: &ServiceName) -> Option<ServiceState> {
        let mut changes = container.subscribe();
        loop {
            match container.state(name) {
                Some(state) if state.is_transitional() => {}
                other => return other,
            }
            tokio::time::timeout(Duration::from_secs(5), changes.changed())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_install_start_stop() {
        let container = InMemoryServiceContainer::new();
        let name = ServiceName::of("jboss").append("good-service");

        container.install(name.clone(), Arc::new(NoopService)).unwrap();
        assert_eq!(settled(&container, &name).await, Some(ServiceState::Up));
        assert_eq!(
            container.install(name.clone(), Arc::new(NoopService)),
            Err(ServiceError::Duplicate(name.clone()))
        );

        container.stop(&name).unwrap();
        assert_eq!(settled(&container, &name).await, Some(ServiceState::Down));
        assert!(container.stop(&name).is_err());

        container.start(&name).unwrap();
        assert_eq!(settled(&container, &name).await, Some(ServiceState::Up));

        container.remove(&name).unwrap();
        assert_eq!(container.state(&name), None);
        assert!(container.services().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let container = InMemoryServiceContainer::new();
        let name = ServiceName::of("jboss").append("bad-service");

        container.install(name.clone(), Arc::new(FailingService)).unwrap();
        assert_eq!(
            settled(&container, &name).await,
            Some(ServiceState::StartFailed("port in use".to_string()))
        );
    }
}
