//! Registry file parsing, validation and overlay merging.
//!
//! The registry file is the authoritative source of service descriptors.
//! Parsing is strict: a single malformed entry rejects the whole reload so
//! the previous snapshot stays live.

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::registry::descriptor::{
    CircuitBreakerConfig, DiscoverySource, ServiceDescriptor, ServiceStatus, Transport,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub mcps: BTreeMap<String, ServiceDescriptor>,
    #[serde(default)]
    pub environments: HashMap<String, EnvironmentSettings>,
    #[serde(default, alias = "globalConfig")]
    pub global_config: Option<DescriptorOverlay>,
    #[serde(default)]
    pub routing_rules: Option<RoutingRules>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSettings {
    #[serde(default, alias = "discoveryMethods")]
    pub discovery_methods: Vec<String>,
    #[serde(default)]
    pub overrides: Option<DescriptorOverlay>,
}

/// Defaults layered onto every descriptor: the global overlay first, then
/// the active environment's. Explicit descriptor values win.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DescriptorOverlay {
    /// Added to HTTP endpoints; keys already present on the endpoint win.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Replaces breaker settings still at their built-in defaults.
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Replaces the health-check interval on entries still at the default.
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingRules {
    #[serde(default)]
    pub patterns: BTreeMap<String, Vec<String>>,
}

/// Compiled routing rules: glob patterns mapped onto capability lists.
#[derive(Debug, Default)]
pub struct RoutingTable {
    rules: Vec<(Regex, Vec<String>)>,
}

impl RoutingTable {
    pub fn compile(rules: &RoutingRules) -> Result<Self, OrchestratorError> {
        let mut compiled = Vec::with_capacity(rules.patterns.len());
        for (glob, capabilities) in &rules.patterns {
            let regex = compile_glob(glob).map_err(|e| {
                OrchestratorError::Validation(format!("routing pattern '{glob}': {e}"))
            })?;
            compiled.push((regex, capabilities.clone()));
        }
        Ok(Self { rules: compiled })
    }

    /// Capabilities required for a request path; first matching pattern wins.
    pub fn capabilities_for(&self, path: &str) -> Option<&[String]> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(path))
            .map(|(_, caps)| caps.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `**` matches across segments, `*` within one segment.
fn compile_glob(glob: &str) -> Result<Regex, regex::Error> {
    let mut pattern = String::with_capacity(glob.len() + 8);
    pattern.push('^');
    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    pattern.push_str(".*");
                } else {
                    pattern.push_str("[^/]+");
                }
            }
            c if "\\.+?()[]{}|^$".contains(c) => {
                pattern.push('\\');
                pattern.push(c);
            }
            c => pattern.push(c),
        }
    }
    pattern.push('$');
    Regex::new(&pattern)
}

pub fn parse_registry_file(text: &str) -> Result<RegistryFile, OrchestratorError> {
    serde_json::from_str(text)
        .map_err(|e| OrchestratorError::Validation(format!("registry file: {e}")))
}

/// Turns a parsed file into validated descriptors for the given environment.
///
/// Validation policy: a missing `name` is filled from the map key, a missing
/// `version` already defaulted to `1.0.0` at parse time; empty `endpoints`
/// or an unparseable endpoint URL rejects the entire reload.
pub fn build_descriptors(
    file: &RegistryFile,
    environment: &str,
) -> Result<BTreeMap<String, ServiceDescriptor>, OrchestratorError> {
    let env_overlay = file
        .environments
        .get(environment)
        .and_then(|settings| settings.overrides.as_ref());

    let mut out = BTreeMap::new();
    for (key, entry) in &file.mcps {
        let mut descriptor = entry.clone();
        if descriptor.name.is_empty() {
            descriptor.name = key.clone();
        }
        if descriptor.endpoints.is_empty() {
            return Err(OrchestratorError::Validation(format!(
                "mcp '{key}': no endpoints configured"
            )));
        }
        for (role, endpoint) in &descriptor.endpoints {
            match &endpoint.transport {
                Transport::Http { url, .. } => {
                    url::Url::parse(url).map_err(|e| {
                        OrchestratorError::Validation(format!(
                            "mcp '{key}' endpoint '{role}': invalid url: {e}"
                        ))
                    })?;
                }
                Transport::Subprocess { command, .. } => {
                    if command.is_empty() {
                        return Err(OrchestratorError::Validation(format!(
                            "mcp '{key}' endpoint '{role}': empty command"
                        )));
                    }
                }
            }
        }

        if let Some(overlay) = &file.global_config {
            apply_overlay(&mut descriptor, overlay);
        }
        if let Some(overlay) = env_overlay {
            apply_overlay(&mut descriptor, overlay);
        }
        descriptor.resolve_env_refs();
        descriptor.source = DiscoverySource::File;
        descriptor.status = ServiceStatus::Active;
        out.insert(descriptor.name.clone(), descriptor);
    }
    Ok(out)
}

fn apply_overlay(descriptor: &mut ServiceDescriptor, overlay: &DescriptorOverlay) {
    if !overlay.headers.is_empty() {
        for endpoint in descriptor.endpoints.values_mut() {
            if let Transport::Http { headers, .. } = &mut endpoint.transport {
                for (key, value) in &overlay.headers {
                    headers
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
        }
    }
    if let Some(breaker) = &overlay.circuit_breaker {
        if descriptor.circuit_breaker == CircuitBreakerConfig::default() {
            descriptor.circuit_breaker = breaker.clone();
        }
    }
    if let Some(interval) = overlay.health_check_interval_ms {
        if descriptor.health_check.interval_ms == DEFAULT_HEALTH_INTERVAL_MS {
            descriptor.health_check.interval_ms = interval;
        }
    }
}

const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_file() -> String {
        json!({
            "version": "2.1.0",
            "mcps": {
                "billing": {
                    "endpoints": {
                        "primary": {"transport": "http", "url": "http://billing:9000"}
                    },
                    "capabilities": ["payments"],
                    "tools": ["charge", "refund"]
                },
                "mailer": {
                    "endpoints": {
                        "primary": {
                            "transport": "subprocess",
                            "command": "mailer-mcp",
                            "args": ["--stdio"]
                        }
                    },
                    "tools": ["send_welcome"]
                }
            },
            "environments": {
                "production": {"discoveryMethods": ["file", "dns", "kubernetes"]}
            },
            "globalConfig": {
                "headers": {"x-orchestrator": "meshflow"}
            },
            "routing_rules": {
                "patterns": {
                    "/api/billing/**": ["payments"],
                    "/api/*/status": ["status"]
                }
            }
        })
        .to_string()
    }

    #[test]
    fn parses_and_builds_descriptors() {
        let file = parse_registry_file(&sample_file()).unwrap();
        let descriptors = build_descriptors(&file, "production").unwrap();
        assert_eq!(descriptors.len(), 2);

        let billing = &descriptors["billing"];
        assert_eq!(billing.name, "billing");
        assert_eq!(billing.version, "1.0.0");
        assert_eq!(billing.status, ServiceStatus::Active);
        match &billing.primary_endpoint().unwrap().transport {
            Transport::Http { headers, .. } => {
                assert_eq!(headers["x-orchestrator"], "meshflow");
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn missing_endpoints_rejects_the_reload() {
        let file = parse_registry_file(
            &json!({"mcps": {"broken": {"endpoints": {}, "tools": []}}}).to_string(),
        )
        .unwrap();
        let err = build_descriptors(&file, "development").unwrap_err();
        assert!(err.to_string().contains("no endpoints"));
    }

    #[test]
    fn invalid_url_rejects_the_reload() {
        let file = parse_registry_file(
            &json!({
                "mcps": {
                    "broken": {
                        "endpoints": {
                            "primary": {"transport": "http", "url": "::not a url::"}
                        }
                    }
                }
            })
            .to_string(),
        )
        .unwrap();
        assert!(build_descriptors(&file, "development").is_err());
    }

    #[test]
    fn routing_globs_match_path_segments() {
        let file = parse_registry_file(&sample_file()).unwrap();
        let table = RoutingTable::compile(file.routing_rules.as_ref().unwrap()).unwrap();

        assert_eq!(
            table.capabilities_for("/api/billing/v1/charge"),
            Some(&["payments".to_string()][..])
        );
        assert_eq!(
            table.capabilities_for("/api/mailer/status"),
            Some(&["status".to_string()][..])
        );
        // single `*` must not cross a path segment
        assert_eq!(table.capabilities_for("/api/a/b/status"), None);
        assert_eq!(table.capabilities_for("/other"), None);
    }

    #[test]
    fn endpoint_headers_win_over_overlay() {
        let file = parse_registry_file(
            &json!({
                "mcps": {
                    "svc": {
                        "endpoints": {
                            "primary": {
                                "transport": "http",
                                "url": "http://svc:1",
                                "headers": {"x-orchestrator": "custom"}
                            }
                        }
                    }
                },
                "globalConfig": {"headers": {"x-orchestrator": "meshflow"}}
            })
            .to_string(),
        )
        .unwrap();
        let descriptors = build_descriptors(&file, "development").unwrap();
        match &descriptors["svc"].primary_endpoint().unwrap().transport {
            Transport::Http { headers, .. } => {
                assert_eq!(headers["x-orchestrator"], "custom");
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }
}
