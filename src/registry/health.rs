//! Periodic health checks for discovered services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::registry::descriptor::{ServiceDescriptor, Transport};
use crate::registry::DiscoveryRegistry;

/// Probe used for tool-call-mode health checks. Implemented by the client
/// layer so the registry stays free of client dependencies.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(
        &self,
        descriptor: &ServiceDescriptor,
        tool: &str,
        timeout: Duration,
    ) -> Result<(), String>;
}

pub struct HealthChecker {
    registry: Arc<DiscoveryRegistry>,
    http: reqwest::Client,
    probe: Option<Arc<dyn HealthProbe>>,
    /// Granularity of the check loop; each descriptor still honours its own
    /// interval.
    tick: Duration,
}

impl HealthChecker {
    pub fn new(registry: Arc<DiscoveryRegistry>, probe: Option<Arc<dyn HealthProbe>>) -> Self {
        Self {
            registry,
            http: reqwest::Client::new(),
            probe,
            tick: Duration::from_secs(5),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.run_due_checks().await;
            }
        })
    }

    pub async fn run_due_checks(&self) {
        for descriptor in self.registry.list() {
            if !descriptor.health_check.enabled {
                continue;
            }
            let due = match descriptor.last_health_check {
                None => true,
                Some(last) => {
                    let elapsed = Utc::now().signed_duration_since(last);
                    elapsed.num_milliseconds() as u128
                        >= u128::from(descriptor.health_check.interval_ms)
                }
            };
            if !due {
                continue;
            }
            let outcome = self.check_one(&descriptor).await;
            match outcome {
                Ok(()) => self.registry.update_health(&descriptor.name, true, None),
                Err(reason) => {
                    self.registry
                        .update_health(&descriptor.name, false, Some(reason))
                }
            }
        }
    }

    async fn check_one(&self, descriptor: &ServiceDescriptor) -> Result<(), String> {
        let timeout = Duration::from_millis(descriptor.health_check.timeout_ms);

        if let Some(tool) = &descriptor.health_check.tool {
            let Some(probe) = &self.probe else {
                debug!(name = %descriptor.name, "tool-call health check skipped: no probe wired");
                return Ok(());
            };
            return probe.probe(descriptor, tool, timeout).await;
        }

        let Some(endpoint) = descriptor.primary_endpoint() else {
            return Err("no endpoint".to_string());
        };
        match &endpoint.transport {
            Transport::Http { url, .. } => {
                let base = url.trim_end_matches('/');
                let path = descriptor.health_check.path.trim_start_matches('/');
                let check_url = format!("{base}/{path}");
                let response = self
                    .http
                    .get(&check_url)
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("HTTP {}", response.status()))
                }
            }
            Transport::Subprocess { .. } => {
                // Subprocess services can only be probed through a tool call.
                warn!(
                    name = %descriptor.name,
                    "subprocess health check requires a tool; skipping"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::events::EventDispatcher;
    use crate::registry::descriptor::{DiscoverySource, EndpointConfig};
    use parking_lot::Mutex;

    struct ScriptedProbe {
        outcomes: Mutex<Vec<Result<(), String>>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(
            &self,
            descriptor: &ServiceDescriptor,
            tool: &str,
            _timeout: Duration,
        ) -> Result<(), String> {
            self.calls
                .lock()
                .push(format!("{}/{}", descriptor.name, tool));
            self.outcomes.lock().remove(0)
        }
    }

    #[tokio::test]
    async fn tool_call_mode_uses_the_probe_and_records_outcome() {
        let registry = Arc::new(DiscoveryRegistry::new(
            RegistryConfig::default(),
            EventDispatcher::new(),
        ));
        let mut descriptor = ServiceDescriptor::discovered(
            "svc",
            EndpointConfig::subprocess("svc-mcp", vec![]),
            DiscoverySource::Env,
        );
        descriptor.health_check.enabled = true;
        descriptor.health_check.tool = Some("ping".to_string());
        registry.register_discovered(descriptor);

        let probe = Arc::new(ScriptedProbe {
            outcomes: Mutex::new(vec![Err("no reply".to_string()), Ok(())]),
            calls: Mutex::new(vec![]),
        });
        let checker = HealthChecker::new(registry.clone(), Some(probe.clone()));

        checker.run_due_checks().await;
        let after_failure = registry.get("svc").unwrap();
        assert!(!after_failure.healthy);
        assert_eq!(after_failure.last_error.as_deref(), Some("no reply"));

        // Force the next check to be due again.
        registry.update_health("svc", false, None);
        let mut stale = (*registry.get("svc").unwrap()).clone();
        stale.last_health_check = Some(Utc::now() - chrono::Duration::hours(1));
        // Re-run with the stale timestamp by checking directly.
        let outcome = checker.check_one(&stale).await;
        assert!(outcome.is_ok());
        assert_eq!(probe.calls.lock().len(), 2);
    }
}
