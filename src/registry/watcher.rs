//! Debounced file watcher driving registry hot reload.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::registry::DiscoveryRegistry;

/// Keeps the watcher and its reload task alive. Dropping the handle stops
/// both.
pub struct RegistryWatcher {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Watches the registry file's directory and reloads after a quiet period.
///
/// The parent directory is watched rather than the file itself because most
/// editors and config-management tools replace the file atomically, which
/// would otherwise drop the watch.
pub fn spawn_registry_watcher(
    registry: Arc<DiscoveryRegistry>,
    path: PathBuf,
    debounce: Duration,
) -> Result<RegistryWatcher, OrchestratorError> {
    let (tx, mut rx) = mpsc::channel::<()>(16);
    let file_name = path.file_name().map(|n| n.to_os_string());

    let mut watcher = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
        match res {
            Ok(event) => {
                let relevant = event.paths.iter().any(|p| match (&file_name, p.file_name()) {
                    (Some(name), Some(changed)) => changed == name.as_os_str(),
                    _ => true,
                });
                if relevant && (event.kind.is_modify() || event.kind.is_create()) {
                    // Coalesce: a full channel already guarantees a reload.
                    let _ = tx.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "registry watch error"),
        }
    })
    .map_err(|e| OrchestratorError::Registry(format!("watcher: {e}")))?;

    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| OrchestratorError::Registry(format!("watch {}: {e}", watch_dir.display())))?;

    let task = tokio::spawn(async move {
        while rx.recv().await.is_some() {
            tokio::time::sleep(debounce).await;
            // Drain signals that arrived during the debounce window.
            while rx.try_recv().is_ok() {}
            debug!(path = %path.display(), "registry file changed, reloading");
            if let Err(e) = registry.load_from_file().await {
                warn!(error = %e, "registry reload failed");
            }
        }
    });

    Ok(RegistryWatcher {
        _watcher: watcher,
        task,
    })
}
