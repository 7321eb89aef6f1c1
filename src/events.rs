//! Orchestrator events and the observer contract.
//!
//! Every state transition in the registry, the resilient clients and the
//! workflow engine is reported as an [`OrchestratorEvent`]. Observers are
//! invoked synchronously, in the order the transitions occur; the
//! [`EventDispatcher`] fans a single emission out to every registered
//! observer and serializes emissions so ordering is preserved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    WorkflowStarted {
        workflow_id: String,
        name: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: String,
        name: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: String,
        name: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCancelled {
        workflow_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompensationStarted {
        workflow_id: String,
        steps: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    WorkflowCompensated {
        workflow_id: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        workflow_id: String,
        step: String,
        mcp: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        workflow_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },
    StepFailed {
        workflow_id: String,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    StepSkipped {
        workflow_id: String,
        step: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    StepCompensated {
        workflow_id: String,
        step: String,
        timestamp: DateTime<Utc>,
    },
    StepCompensationFailed {
        workflow_id: String,
        step: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
    CircuitBreakerStateChange {
        service: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },
    McpDiscovered {
        name: String,
        source: String,
        timestamp: DateTime<Utc>,
    },
    McpUnhealthy {
        name: String,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
    McpsAdded {
        names: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    McpsRemoved {
        names: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    McpsUpdated {
        names: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    RegistryLoaded {
        total: usize,
        added: usize,
        removed: usize,
        updated: usize,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        active_workflows: usize,
        services: usize,
        healthy_services: usize,
        metrics: Value,
        timestamp: DateTime<Utc>,
    },
}

/// Observer invoked synchronously for every orchestrator event.
pub trait OrchestratorObserver: Send + Sync {
    fn on_event(&self, event: &OrchestratorEvent);
}

struct DispatcherInner {
    observers: RwLock<Vec<Arc<dyn OrchestratorObserver>>>,
    // Serializes emission so observers see transitions in order even when
    // they originate from concurrent step tasks.
    emit_lock: Mutex<()>,
}

/// Fan-out dispatcher for [`OrchestratorEvent`]s.
///
/// Cloning is cheap; all clones share the same observer set.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                observers: RwLock::new(Vec::new()),
                emit_lock: Mutex::new(()),
            }),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn OrchestratorObserver>) {
        self.inner.observers.write().push(observer);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.inner.observers.read().is_empty()
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        let observers = self.inner.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        let _guard = self.inner.emit_lock.lock();
        for observer in &observers {
            observer.on_event(&event);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingObserver;
    use super::*;

    #[test]
    fn fan_out_reaches_every_observer() {
        let dispatcher = EventDispatcher::new();
        let first = RecordingObserver::new();
        let second = RecordingObserver::new();
        dispatcher.subscribe(first.clone());
        dispatcher.subscribe(second.clone());

        dispatcher.emit(OrchestratorEvent::McpsAdded {
            names: vec!["billing".into()],
            timestamp: Utc::now(),
        });

        assert_eq!(first.snapshot().len(), 1);
        assert_eq!(second.snapshot().len(), 1);
    }

    #[test]
    fn inactive_dispatcher_is_a_noop() {
        let dispatcher = EventDispatcher::new();
        assert!(!dispatcher.is_active());
        dispatcher.emit(OrchestratorEvent::WorkflowCompensated {
            workflow_id: "wf".into(),
            timestamp: Utc::now(),
        });
    }
}
