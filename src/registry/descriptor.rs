//! Service descriptor model.
//!
//! A descriptor is the registry's authoritative record of one downstream
//! MCP: how to reach it, what it offers, and what the orchestrator last
//! learned about its health.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Active,
    Discovered,
    Failed,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        ServiceStatus::Active
    }
}

/// Where a descriptor came from. File entries are authoritative; auxiliary
/// sources only ever add names the file does not claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoverySource {
    File,
    Env,
    Dns,
    Multicast,
    Cluster,
}

impl Default for DiscoverySource {
    fn default() -> Self {
        DiscoverySource::File
    }
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoverySource::File => "file",
            DiscoverySource::Env => "env",
            DiscoverySource::Dns => "dns",
            DiscoverySource::Multicast => "multicast",
            DiscoverySource::Cluster => "cluster",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Transport {
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    Subprocess {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub transport: Transport,
    /// Per-call timeout for this endpoint.
    #[serde(default = "default_call_timeout_ms")]
    pub timeout_ms: u64,
    /// Overrides the client's default retry budget when set.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl EndpointConfig {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            transport: Transport::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            timeout_ms: default_call_timeout_ms(),
            max_retries: None,
        }
    }

    pub fn subprocess(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: Transport::Subprocess {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            timeout_ms: default_call_timeout_ms(),
            max_retries: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    /// HTTP path probed with GET; 2xx counts as healthy.
    #[serde(default = "default_health_path")]
    pub path: String,
    /// When set, the check calls this tool with empty arguments instead of
    /// issuing an HTTP GET.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_health_path(),
            tool: None,
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_monitoring_period_ms")]
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            monitoring_period_ms: default_monitoring_period_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique within the registry. Auto-filled from the map key when the
    /// file entry omits it.
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub weight: u32,
    /// Endpoints keyed by role; `primary` is preferred.
    pub endpoints: BTreeMap<String, EndpointConfig>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub source: DiscoverySource,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default)]
    pub last_health_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
}

impl ServiceDescriptor {
    /// Minimal descriptor as reported by an auxiliary source.
    pub fn discovered(
        name: impl Into<String>,
        endpoint: EndpointConfig,
        source: DiscoverySource,
    ) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("primary".to_string(), endpoint);
        Self {
            name: name.into(),
            version: default_version(),
            status: ServiceStatus::Discovered,
            priority: 0,
            weight: 0,
            endpoints,
            capabilities: Vec::new(),
            tools: Vec::new(),
            dependencies: Vec::new(),
            health_check: HealthCheckConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            source,
            healthy: true,
            last_health_check: None,
            last_error: None,
            discovered_at: Utc::now(),
        }
    }

    /// The endpoint calls go to: `primary` if present, otherwise the first
    /// role in key order.
    pub fn primary_endpoint(&self) -> Option<&EndpointConfig> {
        self.endpoints
            .get("primary")
            .or_else(|| self.endpoints.values().next())
    }

    /// Compares the configured identity of two descriptors, ignoring
    /// runtime state (health, timestamps). Drives `mcps_updated` diffing.
    pub fn definition_eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.priority == other.priority
            && self.weight == other.weight
            && self.endpoints == other.endpoints
            && self.capabilities == other.capabilities
            && self.tools == other.tools
            && self.dependencies == other.dependencies
            && self.health_check == other.health_check
            && self.circuit_breaker == other.circuit_breaker
            && self.source == other.source
    }

    /// Resolves `${VAR}` references in header values and subprocess
    /// environments against the process environment. Unknown variables are
    /// left untouched.
    pub fn resolve_env_refs(&mut self) {
        for endpoint in self.endpoints.values_mut() {
            match &mut endpoint.transport {
                Transport::Http { headers, .. } => {
                    for value in headers.values_mut() {
                        *value = resolve_env_str(value);
                    }
                }
                Transport::Subprocess { env, .. } => {
                    for value in env.values_mut() {
                        *value = resolve_env_str(value);
                    }
                }
            }
        }
    }
}

fn resolve_env_str(input: &str) -> String {
    use std::sync::OnceLock;
    static ENV_REF: OnceLock<regex::Regex> = OnceLock::new();
    let re = ENV_REF.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env ref pattern is valid")
    });
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}

fn default_version() -> String {
    "1.0.0".to_string()
}
fn default_true() -> bool {
    true
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_health_interval_ms() -> u64 {
    30_000
}
fn default_health_timeout_ms() -> u64 {
    5_000
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_monitoring_period_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_http_entry_with_defaults() {
        let descriptor: ServiceDescriptor = serde_json::from_value(json!({
            "endpoints": {
                "primary": {"transport": "http", "url": "http://localhost:9000"}
            },
            "capabilities": ["billing"],
            "tools": ["charge"]
        }))
        .unwrap();

        assert_eq!(descriptor.version, "1.0.0");
        assert!(descriptor.healthy);
        assert_eq!(descriptor.circuit_breaker.failure_threshold, 5);
        match &descriptor.primary_endpoint().unwrap().transport {
            Transport::Http { url, .. } => assert_eq!(url, "http://localhost:9000"),
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn non_list_capabilities_is_a_parse_error() {
        let result: Result<ServiceDescriptor, _> = serde_json::from_value(json!({
            "endpoints": {
                "primary": {"transport": "http", "url": "http://localhost:9000"}
            },
            "capabilities": "billing"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn missing_endpoints_is_a_parse_error() {
        let result: Result<ServiceDescriptor, _> =
            serde_json::from_value(json!({"name": "broken"}));
        assert!(result.is_err());
    }

    #[test]
    fn definition_eq_ignores_runtime_state() {
        let a = ServiceDescriptor::discovered(
            "svc",
            EndpointConfig::http("http://localhost:9000"),
            DiscoverySource::Env,
        );
        let mut b = a.clone();
        b.healthy = false;
        b.last_error = Some("boom".into());
        b.discovered_at = Utc::now();
        assert!(a.definition_eq(&b));

        b.capabilities.push("extra".into());
        assert!(!a.definition_eq(&b));
    }

    #[test]
    fn resolves_env_refs_in_headers() {
        std::env::set_var("MESHFLOW_TEST_TOKEN", "s3cret");
        let mut descriptor = ServiceDescriptor::discovered(
            "svc",
            EndpointConfig {
                transport: Transport::Http {
                    url: "http://localhost:9000".into(),
                    headers: HashMap::from([
                        ("authorization".to_string(), "Bearer ${MESHFLOW_TEST_TOKEN}".to_string()),
                        ("x-missing".to_string(), "${MESHFLOW_TEST_UNSET}".to_string()),
                    ]),
                },
                timeout_ms: 30_000,
                max_retries: None,
            },
            DiscoverySource::File,
        );
        descriptor.resolve_env_refs();
        match &descriptor.primary_endpoint().unwrap().transport {
            Transport::Http { headers, .. } => {
                assert_eq!(headers["authorization"], "Bearer s3cret");
                assert_eq!(headers["x-missing"], "${MESHFLOW_TEST_UNSET}");
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }
}
