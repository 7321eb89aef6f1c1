//! The discovery registry: authoritative in-memory map of service
//! descriptors, rebuilt atomically on every file reload.
//!
//! Readers take an `Arc` snapshot of the whole map; the reload routine
//! builds a fresh map off to the side and swaps it in one write, so no
//! reader ever observes a partial update.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::OrchestratorError;
use crate::events::{EventDispatcher, OrchestratorEvent};
use crate::registry::descriptor::{ServiceDescriptor, ServiceStatus};
use crate::registry::file_source::{
    build_descriptors, parse_registry_file, RoutingTable,
};

type ServiceMap = HashMap<String, Arc<ServiceDescriptor>>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryMetrics {
    pub services_total: usize,
    pub services_healthy: usize,
    pub by_source: BTreeMap<String, usize>,
    pub reload_count: u64,
    pub last_reload: Option<DateTime<Utc>>,
    pub last_reload_error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    pub total: usize,
}

pub struct DiscoveryRegistry {
    config: RegistryConfig,
    services: RwLock<Arc<ServiceMap>>,
    routing: RwLock<Arc<RoutingTable>>,
    /// Discovery methods from the active environment's file section.
    discovery_methods: RwLock<Vec<String>>,
    dispatcher: EventDispatcher,
    reload_state: Mutex<ReloadState>,
}

#[derive(Default)]
struct ReloadState {
    count: u64,
    last: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl DiscoveryRegistry {
    pub fn new(config: RegistryConfig, dispatcher: EventDispatcher) -> Self {
        Self {
            config,
            services: RwLock::new(Arc::new(HashMap::new())),
            routing: RwLock::new(Arc::new(RoutingTable::default())),
            discovery_methods: RwLock::new(vec!["file".to_string(), "env".to_string()]),
            dispatcher,
            reload_state: Mutex::new(ReloadState::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Reads and applies the configured registry file. A validation failure
    /// leaves the previous snapshot authoritative.
    pub async fn load_from_file(&self) -> Result<ReloadSummary, OrchestratorError> {
        let path = self.config.path.clone().ok_or_else(|| {
            OrchestratorError::Registry("no registry file configured".to_string())
        })?;
        let text = tokio::fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::Registry(format!("read {}: {e}", path.display()))
        })?;
        let result = self.apply_file_text(&text);
        if let Err(err) = &result {
            self.reload_state.lock().last_error = Some(err.to_string());
            warn!(path = %path.display(), error = %err, "registry reload rejected, previous snapshot retained");
        }
        result
    }

    pub fn apply_file_text(&self, text: &str) -> Result<ReloadSummary, OrchestratorError> {
        let file = parse_registry_file(text)?;
        let descriptors = build_descriptors(&file, &self.config.environment)?;

        let routing = match &file.routing_rules {
            Some(rules) => Arc::new(RoutingTable::compile(rules)?),
            None => Arc::new(RoutingTable::default()),
        };
        if let Some(settings) = file.environments.get(&self.config.environment) {
            if !settings.discovery_methods.is_empty() {
                *self.discovery_methods.write() = settings.discovery_methods.clone();
            }
        }

        let summary = self.swap_file_entries(descriptors);
        *self.routing.write() = routing;

        {
            let mut state = self.reload_state.lock();
            state.count += 1;
            state.last = Some(Utc::now());
            state.last_error = None;
        }

        info!(
            total = summary.total,
            added = summary.added.len(),
            removed = summary.removed.len(),
            updated = summary.updated.len(),
            "registry reloaded"
        );
        self.emit_reload_events(&summary);
        Ok(summary)
    }

    /// Builds the next snapshot from validated file entries plus every
    /// auxiliary-sourced descriptor whose name the file does not claim,
    /// then swaps it in atomically.
    fn swap_file_entries(&self, entries: BTreeMap<String, ServiceDescriptor>) -> ReloadSummary {
        let mut services = self.services.write();
        let previous = services.clone();

        let mut next: ServiceMap = HashMap::with_capacity(entries.len());
        let mut summary = ReloadSummary::default();

        for (name, mut descriptor) in entries {
            match previous.get(&name) {
                Some(old) if old.definition_eq(&descriptor) => {
                    // Unchanged definition: keep accumulated runtime state.
                    next.insert(name, old.clone());
                }
                Some(old) => {
                    descriptor.healthy = old.healthy;
                    descriptor.last_health_check = old.last_health_check;
                    descriptor.discovered_at = old.discovered_at;
                    summary.updated.push(name.clone());
                    next.insert(name, Arc::new(descriptor));
                }
                None => {
                    summary.added.push(name.clone());
                    next.insert(name, Arc::new(descriptor));
                }
            }
        }

        // Auxiliary entries persist until process exit; only the file
        // registry dropping a file-sourced name removes a descriptor.
        for (name, descriptor) in previous.iter() {
            if next.contains_key(name) {
                continue;
            }
            if descriptor.source == crate::registry::descriptor::DiscoverySource::File {
                summary.removed.push(name.clone());
            } else {
                next.insert(name.clone(), descriptor.clone());
            }
        }

        summary.total = next.len();
        *services = Arc::new(next);
        summary
    }

    fn emit_reload_events(&self, summary: &ReloadSummary) {
        if !self.dispatcher.is_active() {
            return;
        }
        let now = Utc::now();
        if !summary.added.is_empty() {
            for name in &summary.added {
                self.dispatcher.emit(OrchestratorEvent::McpDiscovered {
                    name: name.clone(),
                    source: "file".to_string(),
                    timestamp: now,
                });
            }
            self.dispatcher.emit(OrchestratorEvent::McpsAdded {
                names: summary.added.clone(),
                timestamp: now,
            });
        }
        if !summary.removed.is_empty() {
            self.dispatcher.emit(OrchestratorEvent::McpsRemoved {
                names: summary.removed.clone(),
                timestamp: now,
            });
        }
        if !summary.updated.is_empty() {
            self.dispatcher.emit(OrchestratorEvent::McpsUpdated {
                names: summary.updated.clone(),
                timestamp: now,
            });
        }
        self.dispatcher.emit(OrchestratorEvent::RegistryLoaded {
            total: summary.total,
            added: summary.added.len(),
            removed: summary.removed.len(),
            updated: summary.updated.len(),
            timestamp: now,
        });
    }

    /// Registers a descriptor reported by an auxiliary source. Add-only:
    /// names already present (from the file or an earlier announcement)
    /// are left untouched. Returns whether the descriptor was added.
    pub fn register_discovered(&self, descriptor: ServiceDescriptor) -> bool {
        let name = descriptor.name.clone();
        let source = descriptor.source;
        {
            let mut services = self.services.write();
            if services.contains_key(&name) {
                return false;
            }
            let mut next: ServiceMap = (**services).clone();
            next.insert(name.clone(), Arc::new(descriptor));
            *services = Arc::new(next);
        }
        debug!(name = %name, source = source.as_str(), "descriptor discovered");
        if self.dispatcher.is_active() {
            let now = Utc::now();
            self.dispatcher.emit(OrchestratorEvent::McpDiscovered {
                name: name.clone(),
                source: source.as_str().to_string(),
                timestamp: now,
            });
            self.dispatcher.emit(OrchestratorEvent::McpsAdded {
                names: vec![name],
                timestamp: now,
            });
        }
        true
    }

    /// Records a health-check outcome. Emits `mcp_unhealthy` on the
    /// healthy→unhealthy transition and flips lifecycle status.
    pub fn update_health(&self, name: &str, healthy: bool, error: Option<String>) {
        let was_healthy;
        {
            let mut services = self.services.write();
            let Some(current) = services.get(name) else {
                return;
            };
            was_healthy = current.healthy;
            let mut updated = (**current).clone();
            updated.healthy = healthy;
            updated.last_health_check = Some(Utc::now());
            updated.last_error = error.clone();
            updated.status = if healthy {
                ServiceStatus::Active
            } else {
                ServiceStatus::Failed
            };
            let mut next: ServiceMap = (**services).clone();
            next.insert(name.to_string(), Arc::new(updated));
            *services = Arc::new(next);
        }
        if was_healthy && !healthy {
            warn!(name, error = error.as_deref().unwrap_or("unknown"), "mcp unhealthy");
            self.dispatcher.emit(OrchestratorEvent::McpUnhealthy {
                name: name.to_string(),
                error,
                timestamp: Utc::now(),
            });
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServiceDescriptor>> {
        self.snapshot().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Arc<ServiceDescriptor>> {
        let mut all: Vec<_> = self.snapshot().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn list_by_capability(&self, capability: &str) -> Vec<Arc<ServiceDescriptor>> {
        self.list()
            .into_iter()
            .filter(|d| d.capabilities.iter().any(|c| c == capability))
            .collect()
    }

    pub fn list_by_tool(&self, tool: &str) -> Vec<Arc<ServiceDescriptor>> {
        self.list()
            .into_iter()
            .filter(|d| d.tools.iter().any(|t| t == tool))
            .collect()
    }

    pub fn list_healthy(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.list().into_iter().filter(|d| d.healthy).collect()
    }

    pub fn routing(&self) -> Arc<RoutingTable> {
        self.routing.read().clone()
    }

    pub fn discovery_methods(&self) -> Vec<String> {
        self.discovery_methods.read().clone()
    }

    pub fn get_metrics(&self) -> RegistryMetrics {
        let snapshot = self.snapshot();
        let mut by_source = BTreeMap::new();
        let mut healthy = 0;
        for descriptor in snapshot.values() {
            *by_source
                .entry(descriptor.source.as_str().to_string())
                .or_insert(0) += 1;
            if descriptor.healthy {
                healthy += 1;
            }
        }
        let state = self.reload_state.lock();
        RegistryMetrics {
            services_total: snapshot.len(),
            services_healthy: healthy,
            by_source,
            reload_count: state.count,
            last_reload: state.last,
            last_reload_error: state.last_error.clone(),
        }
    }

    fn snapshot(&self) -> Arc<ServiceMap> {
        self.services.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingObserver;
    use crate::registry::descriptor::{DiscoverySource, EndpointConfig};
    use serde_json::json;

    fn registry_with_observer() -> (DiscoveryRegistry, Arc<RecordingObserver>) {
        let dispatcher = EventDispatcher::new();
        let observer = RecordingObserver::new();
        dispatcher.subscribe(observer.clone());
        (
            DiscoveryRegistry::new(RegistryConfig::default(), dispatcher),
            observer,
        )
    }

    fn file_with(names: &[&str]) -> String {
        let mut mcps = serde_json::Map::new();
        for name in names {
            mcps.insert(
                name.to_string(),
                json!({
                    "endpoints": {
                        "primary": {"transport": "http", "url": format!("http://{name}:9000")}
                    },
                    "tools": ["run"]
                }),
            );
        }
        json!({"version": "1.0.0", "mcps": mcps}).to_string()
    }

    #[test]
    fn reload_diff_emits_added_removed_updated() {
        let (registry, observer) = registry_with_observer();
        registry.apply_file_text(&file_with(&["a", "b"])).unwrap();

        let summary = registry.apply_file_text(&file_with(&["b", "c"])).unwrap();
        assert_eq!(summary.added, vec!["c"]);
        assert_eq!(summary.removed, vec!["a"]);
        assert!(summary.updated.is_empty());

        assert!(registry.get("a").is_none());
        assert!(registry.get("c").is_some());

        let has_removed = observer.snapshot().iter().any(|e| {
            matches!(e, OrchestratorEvent::McpsRemoved { names, .. } if names == &vec!["a".to_string()])
        });
        assert!(has_removed);
    }

    #[test]
    fn failed_reload_retains_previous_snapshot() {
        let (registry, _observer) = registry_with_observer();
        registry.apply_file_text(&file_with(&["a"])).unwrap();

        let broken = json!({"mcps": {"b": {"endpoints": {}}}}).to_string();
        assert!(registry.apply_file_text(&broken).is_err());

        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
    }

    #[test]
    fn auxiliary_entries_survive_reload_and_never_override() {
        let (registry, _observer) = registry_with_observer();
        assert!(registry.register_discovered(ServiceDescriptor::discovered(
            "beacon",
            EndpointConfig::http("http://beacon:1"),
            DiscoverySource::Multicast,
        )));
        // Second announcement for the same name is ignored.
        assert!(!registry.register_discovered(ServiceDescriptor::discovered(
            "beacon",
            EndpointConfig::http("http://elsewhere:2"),
            DiscoverySource::Env,
        )));

        registry.apply_file_text(&file_with(&["a"])).unwrap();
        let beacon = registry.get("beacon").unwrap();
        assert_eq!(beacon.source, DiscoverySource::Multicast);
        assert!(registry.get("a").is_some());
    }

    #[test]
    fn update_health_emits_on_transition_only() {
        let (registry, observer) = registry_with_observer();
        registry.apply_file_text(&file_with(&["a"])).unwrap();

        registry.update_health("a", false, Some("connect refused".into()));
        registry.update_health("a", false, Some("connect refused".into()));
        registry.update_health("a", true, None);

        let unhealthy_events = observer
            .snapshot()
            .iter()
            .filter(|e| matches!(e, OrchestratorEvent::McpUnhealthy { .. }))
            .count();
        assert_eq!(unhealthy_events, 1);
        assert!(registry.get("a").unwrap().healthy);
        assert_eq!(registry.get("a").unwrap().status, ServiceStatus::Active);
    }

    #[test]
    fn query_operations_filter_by_capability_and_tool() {
        let (registry, _observer) = registry_with_observer();
        let text = json!({
            "mcps": {
                "billing": {
                    "endpoints": {"primary": {"transport": "http", "url": "http://b:1"}},
                    "capabilities": ["payments"],
                    "tools": ["charge"]
                },
                "mailer": {
                    "endpoints": {"primary": {"transport": "http", "url": "http://m:1"}},
                    "capabilities": ["email"],
                    "tools": ["send"]
                }
            }
        })
        .to_string();
        registry.apply_file_text(&text).unwrap();

        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.list_by_capability("payments").len(), 1);
        assert_eq!(registry.list_by_tool("send")[0].name, "mailer");

        registry.update_health("mailer", false, None);
        let healthy = registry.list_healthy();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "billing");

        let metrics = registry.get_metrics();
        assert_eq!(metrics.services_total, 2);
        assert_eq!(metrics.services_healthy, 1);
    }
}
