//! Orchestrator configuration.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the workflow engine and its surrounding services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Admission limit for concurrently running workflows.
    #[serde(default = "default_max_concurrent_workflows")]
    pub max_concurrent_workflows: usize,
    /// Global budget for concurrently running steps, shared by all workflows.
    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,
    /// How long finished execution contexts stay readable in history.
    #[serde(default = "default_history_retention_secs")]
    pub history_retention_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_workflows: default_max_concurrent_workflows(),
            max_concurrent_steps: default_max_concurrent_steps(),
            history_retention_secs: default_history_retention_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            registry: RegistryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Configuration for the discovery registry and its auxiliary sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Path of the registry file. `None` disables the file source.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Debounce window applied to file-change notifications.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Deployment environment; selects an entry of the file's
    /// `environments` section. Read from `NODE_ENV` when absent.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Default interval between health-check passes.
    #[serde(default = "default_health_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Domain queried for SRV records by the DNS source.
    #[serde(default)]
    pub dns_domain: Option<String>,
    #[serde(default = "default_dns_refresh_secs")]
    pub dns_refresh_secs: u64,
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: None,
            debounce_ms: default_debounce_ms(),
            environment: default_environment(),
            health_check_interval_ms: default_health_interval_ms(),
            dns_domain: None,
            dns_refresh_secs: default_dns_refresh_secs(),
            multicast: MulticastConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastConfig {
    #[serde(default = "default_multicast_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_multicast_port")]
    pub port: u16,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            group: default_multicast_group(),
            port: default_multicast_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_api_server")]
    pub api_server: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bearer token; read from `token_path` when unset.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
    #[serde(default = "default_cluster_refresh_secs")]
    pub refresh_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            namespace: default_namespace(),
            token: None,
            token_path: default_token_path(),
            refresh_secs: default_cluster_refresh_secs(),
        }
    }
}

fn default_max_concurrent_workflows() -> usize {
    100
}
fn default_max_concurrent_steps() -> usize {
    10
}
fn default_history_retention_secs() -> u64 {
    24 * 60 * 60
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_debounce_ms() -> u64 {
    1000
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_dns_refresh_secs() -> u64 {
    60
}
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(239, 255, 42, 99)
}
fn default_multicast_port() -> u16 {
    42424
}
fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}
fn default_namespace() -> String {
    "default".to_string()
}
fn default_token_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}
fn default_cluster_refresh_secs() -> u64 {
    60
}

fn default_environment() -> String {
    std::env::var("NODE_ENV").unwrap_or_else(|_| "development".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_concurrent_workflows, 100);
        assert_eq!(config.max_concurrent_steps, 10);
        assert_eq!(config.history_retention(), Duration::from_secs(86_400));
        assert_eq!(config.registry.debounce(), Duration::from_millis(1000));
    }

    #[test]
    fn registry_config_deserializes_with_partial_fields() {
        let config: RegistryConfig =
            serde_json::from_str(r#"{"path": "/etc/mcp/registry.json", "debounce_ms": 250}"#)
                .unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert_eq!(config.health_check_interval_ms, 30_000);
    }
}
