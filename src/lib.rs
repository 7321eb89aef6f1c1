//! meshflow: a service-mesh orchestrator.
//!
//! Three subsystems compose bottom-up: the [`registry`] discovers and
//! health-checks downstream MCP services, the [`client`] stack wraps every
//! outbound call in a circuit breaker, connection pool and retry loop, and
//! the [`workflow`] engine executes declarative step DAGs across those
//! services with saga-style compensation.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod workflow;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

pub use crate::client::{
    ClientManager, ConnectionPool, PoolConfig, ResilientClient, RetryPolicy, ToolInvoker,
};
pub use crate::config::{OrchestratorConfig, RegistryConfig};
pub use crate::error::{CallError, OrchestratorError, OrchestratorResult};
pub use crate::events::{EventDispatcher, OrchestratorEvent, OrchestratorObserver};
pub use crate::registry::{
    DiscoveryRegistry, EndpointConfig, HealthChecker, RegistryMetrics, ServiceDescriptor,
};
pub use crate::workflow::{
    EngineMetrics, ExecuteOptions, ExecutionStatus, StepDefinition, WorkflowDefinition,
    WorkflowEngine, WorkflowState,
};

use crate::client::ClientLifecycle;
use crate::registry::{
    scan_environment, spawn_cluster_source, spawn_dns_source, spawn_multicast_source,
    spawn_registry_watcher, RegistryWatcher,
};

/// Wires the registry, client manager and workflow engine together and
/// owns their background tasks. The process hosts exactly one of these;
/// construct it explicitly and pass it where needed.
pub struct Orchestrator {
    config: OrchestratorConfig,
    dispatcher: EventDispatcher,
    registry: Arc<DiscoveryRegistry>,
    clients: Arc<ClientManager>,
    engine: Arc<WorkflowEngine>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    watcher: Mutex<Option<RegistryWatcher>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let dispatcher = EventDispatcher::new();
        let registry = Arc::new(DiscoveryRegistry::new(
            config.registry.clone(),
            dispatcher.clone(),
        ));
        let clients = Arc::new(ClientManager::new(registry.clone(), dispatcher.clone()));
        dispatcher.subscribe(ClientLifecycle::new(clients.clone()));
        let engine = Arc::new(WorkflowEngine::new(
            config.clone(),
            clients.clone(),
            dispatcher.clone(),
        ));
        Self {
            config,
            dispatcher,
            registry,
            clients,
            engine,
            tasks: Mutex::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Loads the registry file and spawns the watcher, the auxiliary
    /// discovery sources named by the active environment, health checks and
    /// the heartbeat.
    pub async fn start(&self) -> OrchestratorResult<()> {
        if let Some(path) = self.config.registry.path.clone() {
            if let Err(error) = self.registry.load_from_file().await {
                warn!(error = %error, "initial registry load failed");
            }
            let watcher = spawn_registry_watcher(
                self.registry.clone(),
                path,
                self.config.registry.debounce(),
            )?;
            *self.watcher.lock() = Some(watcher);
        }

        let methods = self.registry.discovery_methods();
        let mut tasks = self.tasks.lock();

        if methods.iter().any(|m| m == "env") {
            let registered = scan_environment(&self.registry);
            if registered > 0 {
                info!(registered, "environment scan complete");
            }
        }
        if methods.iter().any(|m| m == "dns") {
            if let Some(domain) = self.config.registry.dns_domain.clone() {
                tasks.push(spawn_dns_source(
                    self.registry.clone(),
                    domain,
                    std::time::Duration::from_secs(self.config.registry.dns_refresh_secs),
                ));
            } else {
                warn!("dns discovery enabled but no domain configured");
            }
        }
        if methods.iter().any(|m| m == "multicast") {
            tasks.push(spawn_multicast_source(
                self.registry.clone(),
                self.config.registry.multicast.clone(),
            ));
        }
        if methods.iter().any(|m| m == "kubernetes" || m == "cluster") {
            tasks.push(spawn_cluster_source(
                self.registry.clone(),
                self.config.registry.cluster.clone(),
            ));
        }

        let tick = (self.config.registry.health_check_interval() / 6)
            .max(std::time::Duration::from_secs(1));
        let checker = HealthChecker::new(self.registry.clone(), Some(self.clients.clone()))
            .with_tick(tick);
        tasks.push(checker.spawn());

        tasks.push(self.spawn_heartbeat());
        info!(environment = %self.config.registry.environment, "orchestrator started");
        Ok(())
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        let engine = self.engine.clone();
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let registry_metrics = registry.get_metrics();
                let engine_metrics = engine.get_metrics();
                dispatcher.emit(OrchestratorEvent::Heartbeat {
                    active_workflows: engine_metrics.active_workflows,
                    services: registry_metrics.services_total,
                    healthy_services: registry_metrics.services_healthy,
                    metrics: serde_json::json!({
                        "engine": engine_metrics,
                        "registry": registry_metrics,
                    }),
                    timestamp: chrono::Utc::now(),
                });
            }
        })
    }

    /// Stops background tasks and closes every client pool. In-flight
    /// workflows owned by callers drain on their own.
    pub async fn shutdown(&self) {
        *self.watcher.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.clients.shutdown_all().await;
        info!("orchestrator stopped");
    }

    pub fn subscribe(&self, observer: Arc<dyn OrchestratorObserver>) {
        self.dispatcher.subscribe(observer);
    }

    pub fn registry(&self) -> &Arc<DiscoveryRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine> {
        &self.engine
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }
}
