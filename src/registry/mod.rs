//! Service discovery: descriptors, the hot-reloadable registry, auxiliary
//! sources and health checking.

pub mod descriptor;
pub mod file_source;
pub mod health;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod sources;
pub mod watcher;

pub use descriptor::{
    CircuitBreakerConfig, DiscoverySource, EndpointConfig, HealthCheckConfig, ServiceDescriptor,
    ServiceStatus, Transport,
};
pub use file_source::{RegistryFile, RoutingTable};
pub use health::{HealthChecker, HealthProbe};
pub use registry::{DiscoveryRegistry, RegistryMetrics, ReloadSummary};
pub use sources::{scan_environment, spawn_cluster_source, spawn_dns_source, spawn_multicast_source};
pub use watcher::{spawn_registry_watcher, RegistryWatcher};
