//! The resilient client: circuit breaker, connection pool and retry loop
//! composed behind a single `call_tool` operation, plus the manager that
//! owns one client per discovered service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::client::breaker::{BreakerStatus, CircuitBreaker};
use crate::client::pool::{spawn_pool_sweeper, ConnectionPool, PoolConfig, PoolStats};
use crate::client::retry::RetryPolicy;
use crate::client::transport::EndpointFactory;
use crate::error::{CallError, OrchestratorError};
use crate::events::{EventDispatcher, OrchestratorEvent, OrchestratorObserver};
use crate::registry::descriptor::ServiceDescriptor;
use crate::registry::{DiscoveryRegistry, HealthProbe};

/// Seam between the workflow engine and the client layer. Tests drive the
/// engine with scripted implementations.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(
        &self,
        service: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, OrchestratorError>;
}

pub struct ResilientClient {
    service: String,
    default_timeout: Duration,
    pool: Arc<ConnectionPool>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    sweeper: tokio::task::JoinHandle<()>,
}

impl ResilientClient {
    /// Builds a client for a descriptor's primary endpoint. Endpoint
    /// overrides (`timeout_ms`, `max_retries`) take effect here.
    pub fn from_descriptor(
        descriptor: &ServiceDescriptor,
        http: reqwest::Client,
        dispatcher: EventDispatcher,
    ) -> Result<Self, CallError> {
        let endpoint = descriptor
            .primary_endpoint()
            .ok_or_else(|| CallError::InvalidEndpoint("no endpoints".to_string()))?
            .clone();
        let mut retry = RetryPolicy::default();
        if let Some(max_retries) = endpoint.max_retries {
            retry.max_retries = max_retries;
        }
        let default_timeout = Duration::from_millis(endpoint.timeout_ms);
        let factory = Arc::new(EndpointFactory::new(endpoint, http));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), factory));
        let sweeper = spawn_pool_sweeper(pool.clone());
        Ok(Self {
            service: descriptor.name.clone(),
            default_timeout,
            pool,
            breaker: CircuitBreaker::new(
                descriptor.name.clone(),
                descriptor.circuit_breaker.clone(),
                dispatcher,
            ),
            retry,
            sweeper,
        })
    }

    pub async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, CallError> {
        self.call_tool_with_timeout(tool, params, self.default_timeout)
            .await
    }

    /// Invokes `tool` with the retry/backoff policy; each attempt runs under
    /// the circuit breaker and is bounded by `timeout`.
    pub async fn call_tool_with_timeout(
        &self,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .breaker
                .execute(|| self.dispatch(tool, params.clone(), timeout))
                .await;
            match result {
                Ok(value) => return Ok(value),
                Err(error) if attempt < self.retry.max_retries && error.is_retryable() => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    debug!(
                        service = %self.service,
                        tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying tool call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn dispatch(
        &self,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let conn = self.pool.acquire().await?;
        let outcome = conn
            .call(
                "tools/call",
                json!({"name": tool, "arguments": params}),
                timeout,
            )
            .await;
        // A connection that died under the call must not be recycled.
        if conn.is_alive() {
            self.pool.release(conn).await;
        } else {
            self.pool.discard(conn).await;
        }
        outcome
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.breaker.status()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn shutdown(&self) {
        self.sweeper.abort();
        self.pool.close().await;
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

/// Owns one [`ResilientClient`] per service, built lazily from descriptors
/// and torn down when the registry drops or reshapes a service.
pub struct ClientManager {
    registry: Arc<DiscoveryRegistry>,
    clients: DashMap<String, Arc<ResilientClient>>,
    http: reqwest::Client,
    dispatcher: EventDispatcher,
}

impl ClientManager {
    pub fn new(registry: Arc<DiscoveryRegistry>, dispatcher: EventDispatcher) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
            http: reqwest::Client::new(),
            dispatcher,
        }
    }

    pub fn client_for(&self, service: &str) -> Result<Arc<ResilientClient>, OrchestratorError> {
        if let Some(client) = self.clients.get(service) {
            return Ok(client.value().clone());
        }
        let descriptor = self
            .registry
            .get(service)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(service.to_string()))?;
        let client = Arc::new(ResilientClient::from_descriptor(
            &descriptor,
            self.http.clone(),
            self.dispatcher.clone(),
        )?);
        let entry = self
            .clients
            .entry(service.to_string())
            .or_insert_with(|| client);
        Ok(entry.value().clone())
    }

    /// Destroys the client for a removed or updated service; the next call
    /// rebuilds it from the current descriptor.
    pub async fn remove(&self, service: &str) {
        if let Some((_, client)) = self.clients.remove(service) {
            info!(service, "destroying client");
            client.shutdown().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.remove(&name).await;
        }
    }

    pub fn client_if_present(&self, service: &str) -> Option<Arc<ResilientClient>> {
        self.clients.get(service).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ToolInvoker for ClientManager {
    async fn call_tool(
        &self,
        service: &str,
        tool: &str,
        params: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, OrchestratorError> {
        let client = self.client_for(service)?;
        let result = match timeout {
            Some(timeout) => client.call_tool_with_timeout(tool, params, timeout).await,
            None => client.call_tool(tool, params).await,
        };
        result.map_err(OrchestratorError::Call)
    }
}

#[async_trait]
impl HealthProbe for ClientManager {
    async fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        tool: &str,
        timeout: Duration,
    ) -> Result<(), String> {
        let client = self
            .client_for(&descriptor.name)
            .map_err(|e| e.to_string())?;
        client
            .call_tool_with_timeout(tool, json!({}), timeout)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// Registry observer that keeps the client map in lockstep with discovery:
/// removed or updated descriptors invalidate their client.
pub struct ClientLifecycle {
    manager: Arc<ClientManager>,
}

impl ClientLifecycle {
    pub fn new(manager: Arc<ClientManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

impl OrchestratorObserver for ClientLifecycle {
    fn on_event(&self, event: &OrchestratorEvent) {
        let names = match event {
            OrchestratorEvent::McpsRemoved { names, .. }
            | OrchestratorEvent::McpsUpdated { names, .. } => names.clone(),
            _ => return,
        };
        let manager = self.manager.clone();
        tokio::spawn(async move {
            for name in names {
                manager.remove(&name).await;
            }
        });
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        if !self.clients.is_empty() {
            warn!(clients = self.clients.len(), "client manager dropped with live clients");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::descriptor::{DiscoverySource, EndpointConfig};

    fn registry_with_service(name: &str) -> Arc<DiscoveryRegistry> {
        let registry = Arc::new(DiscoveryRegistry::new(
            RegistryConfig::default(),
            EventDispatcher::new(),
        ));
        registry.register_discovered(ServiceDescriptor::discovered(
            name,
            EndpointConfig::http("http://127.0.0.1:9"),
            DiscoverySource::Env,
        ));
        registry
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let manager = ClientManager::new(
            registry_with_service("known"),
            EventDispatcher::new(),
        );
        let result = manager
            .call_tool("missing", "run", json!({}), None)
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn clients_are_cached_per_service() {
        let manager = ClientManager::new(
            registry_with_service("svc"),
            EventDispatcher::new(),
        );
        let first = manager.client_for("svc").unwrap();
        let second = manager.client_for("svc").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.remove("svc").await;
        let third = manager.client_for("svc").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        manager.shutdown_all().await;
    }
}
