//! Auxiliary discovery sources: environment scan, DNS SRV, UDP multicast
//! and the cluster API.
//!
//! Every source is add-only: it registers names the registry does not know
//! yet and never overrides the file registry or another source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, MulticastConfig};
use crate::registry::descriptor::{DiscoverySource, EndpointConfig, ServiceDescriptor};
use crate::registry::DiscoveryRegistry;

/// Scans the process environment for `MCP_<NAME>_ENDPOINT` variables.
///
/// Values beginning with `http` become HTTP endpoints; anything else is
/// split on whitespace into a subprocess command line.
pub fn scan_environment(registry: &DiscoveryRegistry) -> usize {
    scan_environment_vars(registry, std::env::vars())
}

fn scan_environment_vars(
    registry: &DiscoveryRegistry,
    vars: impl Iterator<Item = (String, String)>,
) -> usize {
    let mut registered = 0;
    for (key, value) in vars {
        let Some(name) = key
            .strip_prefix("MCP_")
            .and_then(|rest| rest.strip_suffix("_ENDPOINT"))
        else {
            continue;
        };
        if name.is_empty() || value.trim().is_empty() {
            continue;
        }
        let name = name.to_lowercase();
        let endpoint = endpoint_from_value(value.trim());
        let Some(endpoint) = endpoint else {
            warn!(var = %key, "unusable MCP endpoint value");
            continue;
        };
        let descriptor = ServiceDescriptor::discovered(&name, endpoint, DiscoverySource::Env);
        if registry.register_discovered(descriptor) {
            info!(name = %name, "registered MCP from environment");
            registered += 1;
        }
    }
    registered
}

fn endpoint_from_value(value: &str) -> Option<EndpointConfig> {
    if value.starts_with("http") {
        Some(EndpointConfig::http(value))
    } else {
        let mut parts = value.split_whitespace();
        let command = parts.next()?;
        let args: Vec<String> = parts.map(str::to_string).collect();
        Some(EndpointConfig::subprocess(command, args))
    }
}

/// Periodically resolves SRV records for the configured domain. Each record
/// yields an HTTP descriptor at `http://<target>:<port>` carrying the
/// record's priority and weight.
pub fn spawn_dns_source(
    registry: Arc<DiscoveryRegistry>,
    domain: String,
    refresh: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let resolver = match hickory_resolver::TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!(error = %e, "dns source disabled: no system resolver");
                return;
            }
        };
        let mut interval = tokio::time::interval(refresh);
        loop {
            interval.tick().await;
            match resolver.srv_lookup(domain.clone()).await {
                Ok(lookup) => {
                    for record in lookup.iter() {
                        let target = record.target().to_utf8();
                        let target = target.trim_end_matches('.');
                        let Some(name) = target.split('.').next().map(str::to_lowercase) else {
                            continue;
                        };
                        if name.is_empty() {
                            continue;
                        }
                        let url = format!("http://{}:{}", target, record.port());
                        let mut descriptor = ServiceDescriptor::discovered(
                            &name,
                            EndpointConfig::http(url),
                            DiscoverySource::Dns,
                        );
                        descriptor.priority = i32::from(record.priority());
                        descriptor.weight = u32::from(record.weight());
                        if registry.register_discovered(descriptor) {
                            info!(name = %name, "registered MCP from DNS SRV");
                        }
                    }
                }
                Err(e) => debug!(domain = %domain, error = %e, "srv lookup failed"),
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct Announcement {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
}

/// Listens on a UDP multicast group for peer announcements of the shape
/// `{"type": "mcp_announcement", "name": ..., "port": ..., "url"?: ...}`.
pub fn spawn_multicast_source(
    registry: Arc<DiscoveryRegistry>,
    config: MulticastConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match tokio::net::UdpSocket::bind(("0.0.0.0", config.port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port = config.port, error = %e, "multicast source disabled: bind failed");
                return;
            }
        };
        if let Err(e) = socket.join_multicast_v4(config.group, std::net::Ipv4Addr::UNSPECIFIED) {
            warn!(group = %config.group, error = %e, "multicast source disabled: join failed");
            return;
        }
        info!(group = %config.group, port = config.port, "listening for MCP announcements");

        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "multicast receive failed");
                    continue;
                }
            };
            let announcement: Announcement = match serde_json::from_slice(&buf[..len]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!(from = %addr, error = %e, "ignoring malformed announcement");
                    continue;
                }
            };
            if announcement.kind != "mcp_announcement" || announcement.name.is_empty() {
                continue;
            }
            if announcement
                .protocol
                .as_deref()
                .map(|p| p != "http")
                .unwrap_or(false)
            {
                debug!(name = %announcement.name, "ignoring non-http announcement");
                continue;
            }
            let url = match (&announcement.url, announcement.port) {
                (Some(url), _) => url.clone(),
                (None, Some(port)) => format!("http://{}:{}", addr.ip(), port),
                (None, None) => continue,
            };
            let descriptor = ServiceDescriptor::discovered(
                announcement.name.to_lowercase(),
                EndpointConfig::http(url),
                DiscoverySource::Multicast,
            );
            if registry.register_discovered(descriptor) {
                info!(name = %announcement.name, from = %addr, "registered MCP from multicast");
            }
        }
    })
}

#[derive(Debug, Deserialize)]
struct ServiceList {
    #[serde(default)]
    items: Vec<ClusterService>,
}

#[derive(Debug, Deserialize)]
struct ClusterService {
    metadata: ClusterMetadata,
    #[serde(default)]
    spec: ClusterServiceSpec,
}

#[derive(Debug, Deserialize)]
struct ClusterMetadata {
    name: String,
    #[serde(default)]
    labels: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterServiceSpec {
    #[serde(default, rename = "clusterIP")]
    cluster_ip: Option<String>,
    #[serde(default)]
    ports: Vec<ClusterPort>,
}

#[derive(Debug, Deserialize)]
struct ClusterPort {
    port: u16,
}

/// Periodically lists cluster services labelled `type=mcp` and registers a
/// descriptor per service, taking capabilities from the
/// `mcp/capabilities` label (comma-separated).
pub fn spawn_cluster_source(
    registry: Arc<DiscoveryRegistry>,
    config: ClusterConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let token = match &config.token {
            Some(token) => Some(token.clone()),
            None => tokio::fs::read_to_string(&config.token_path)
                .await
                .ok()
                .map(|t| t.trim().to_string()),
        };
        let client = match reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "cluster source disabled: http client");
                return;
            }
        };
        let url = format!(
            "{}/api/v1/namespaces/{}/services",
            config.api_server.trim_end_matches('/'),
            config.namespace
        );
        let mut interval = tokio::time::interval(Duration::from_secs(config.refresh_secs));
        loop {
            interval.tick().await;
            let mut request = client.get(&url).query(&[("labelSelector", "type=mcp")]);
            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }
            let list: ServiceList = match request.send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(response) => match response.json().await {
                        Ok(list) => list,
                        Err(e) => {
                            debug!(error = %e, "cluster list: bad body");
                            continue;
                        }
                    },
                    Err(e) => {
                        debug!(error = %e, "cluster list rejected");
                        continue;
                    }
                },
                Err(e) => {
                    debug!(error = %e, "cluster api unreachable");
                    continue;
                }
            };
            for service in list.items {
                let Some(port) = service.spec.ports.first().map(|p| p.port) else {
                    continue;
                };
                let host = service
                    .spec
                    .cluster_ip
                    .clone()
                    .filter(|ip| !ip.is_empty() && ip != "None")
                    .unwrap_or_else(|| {
                        format!("{}.{}.svc", service.metadata.name, config.namespace)
                    });
                let mut descriptor = ServiceDescriptor::discovered(
                    service.metadata.name.to_lowercase(),
                    EndpointConfig::http(format!("http://{host}:{port}")),
                    DiscoverySource::Cluster,
                );
                if let Some(caps) = service.metadata.labels.get("mcp/capabilities") {
                    descriptor.capabilities =
                        caps.split(',').map(|c| c.trim().to_string()).collect();
                }
                if registry.register_discovered(descriptor) {
                    info!(name = %service.metadata.name, "registered MCP from cluster api");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::events::EventDispatcher;
    use crate::registry::descriptor::Transport;

    fn empty_registry() -> DiscoveryRegistry {
        DiscoveryRegistry::new(RegistryConfig::default(), EventDispatcher::new())
    }

    #[test]
    fn env_scan_registers_http_and_subprocess_endpoints() {
        let registry = empty_registry();
        let vars = vec![
            (
                "MCP_BILLING_ENDPOINT".to_string(),
                "http://billing:9000".to_string(),
            ),
            (
                "MCP_MAILER_ENDPOINT".to_string(),
                "mailer-mcp --stdio".to_string(),
            ),
            ("UNRELATED".to_string(), "x".to_string()),
            ("MCP__ENDPOINT".to_string(), "http://x".to_string()),
        ];
        assert_eq!(scan_environment_vars(&registry, vars.into_iter()), 2);

        let billing = registry.get("billing").unwrap();
        assert_eq!(billing.source, DiscoverySource::Env);
        assert!(matches!(
            billing.primary_endpoint().unwrap().transport,
            Transport::Http { .. }
        ));

        let mailer = registry.get("mailer").unwrap();
        match &mailer.primary_endpoint().unwrap().transport {
            Transport::Subprocess { command, args, .. } => {
                assert_eq!(command, "mailer-mcp");
                assert_eq!(args, &vec!["--stdio".to_string()]);
            }
            other => panic!("unexpected transport: {other:?}"),
        }
    }

    #[test]
    fn env_scan_does_not_override_existing_names() {
        let registry = empty_registry();
        registry.register_discovered(ServiceDescriptor::discovered(
            "billing",
            EndpointConfig::http("http://original:1"),
            DiscoverySource::Multicast,
        ));
        let vars = vec![(
            "MCP_BILLING_ENDPOINT".to_string(),
            "http://other:2".to_string(),
        )];
        assert_eq!(scan_environment_vars(&registry, vars.into_iter()), 0);
        assert_eq!(
            registry.get("billing").unwrap().source,
            DiscoverySource::Multicast
        );
    }
}
