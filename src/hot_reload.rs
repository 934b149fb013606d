//! Plugin hot-reload support.
//!
//! Watches the plugin config file and plugin directories. Every burst of
//! changes is collapsed into one orchestration pass, so enable/disable edits
//! and newly installed plugins apply without a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::extensions::PluginManager;

/// Events emitted when plugin state on disk changes.
#[derive(Debug, Clone)]
pub enum ReloadEvent {
    /// A watched file or directory entry changed.
    FileChanged { path: PathBuf },
    /// Reload requested explicitly.
    Manual,
}

/// File watcher feeding [`ReloadEvent`]s to subscribers.
pub struct ConfigWatcher {
    watched_paths: Vec<PathBuf>,
    tx: broadcast::Sender<ReloadEvent>,
    /// Underlying watchers, kept alive for the lifetime of this value.
    watchers: Vec<RecommendedWatcher>,
}

impl ConfigWatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            watched_paths: Vec::new(),
            tx,
            watchers: Vec::new(),
        }
    }

    /// Watch a single file.
    ///
    /// The parent directory is watched instead of the file itself, so the
    /// file may be replaced by rename (as atomic writes do) or not exist yet.
    pub fn watch_file(&mut self, path: PathBuf) -> Result<(), notify::Error> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&parent).map_err(notify::Error::io)?;

        let tx = self.tx.clone();
        let file_name = path.file_name().map(|n| n.to_os_string());
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let Ok(event) = res else { return };
            if !is_change(&event.kind) {
                return;
            }
            for changed in &event.paths {
                if changed.file_name().map(|n| n.to_os_string()) == file_name {
                    let _ = tx.send(ReloadEvent::FileChanged {
                        path: changed.clone(),
                    });
                }
            }
        })?;
        watcher.watch(&parent, RecursiveMode::NonRecursive)?;

        tracing::debug!(path = %path.display(), "Watching file");
        self.watched_paths.push(path);
        self.watchers.push(watcher);
        Ok(())
    }

    /// Watch a directory tree. Missing directories are skipped.
    pub fn watch_dir(&mut self, path: PathBuf) -> Result<(), notify::Error> {
        if !path.is_dir() {
            tracing::debug!(path = %path.display(), "Not watching missing directory");
            return Ok(());
        }
        let tx = self.tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res
                && is_change(&event.kind)
            {
                for changed in event.paths {
                    let _ = tx.send(ReloadEvent::FileChanged { path: changed });
                }
            }
        })?;
        watcher.watch(&path, RecursiveMode::Recursive)?;

        tracing::debug!(path = %path.display(), "Watching directory");
        self.watched_paths.push(path);
        self.watchers.push(watcher);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadEvent> {
        self.tx.subscribe()
    }

    /// Manually trigger a reload.
    pub fn trigger_reload(&self) {
        let _ = self.tx.send(ReloadEvent::Manual);
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched_paths
    }
}

impl Default for ConfigWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Run an orchestration pass after each debounced burst of reload events.
///
/// The task ends when every sender of `events` is gone.
pub fn spawn_reloader(
    manager: Arc<PluginManager>,
    mut events: broadcast::Receiver<ReloadEvent>,
    debounce: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(debounce_ms = debounce.as_millis() as u64, "Plugin hot reload started");
        loop {
            match events.recv().await {
                Ok(event) => tracing::debug!(event = ?event, "Reload event"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Reload events lagged");
                }
                Err(RecvError::Closed) => break,
            }

            let mut closed = false;
            let quiet = tokio::time::sleep(debounce);
            tokio::pin!(quiet);
            loop {
                tokio::select! {
                    _ = &mut quiet => break,
                    next = events.recv() => {
                        if matches!(next, Err(RecvError::Closed)) {
                            closed = true;
                            break;
                        }
                    }
                }
            }

            let report = manager.orchestrate().await;
            tracing::info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                removed = report.removed.len(),
                "Plugins reloaded"
            );
            if closed {
                break;
            }
        }
        tracing::debug!("Plugin hot reload stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{WEBHOOK_ENTRY_POINT, WebhookFactory};
    use crate::extensions::{
        FactoryRegistry, MANIFEST_FILE, PluginConfigStore, PluginDiscovery, PluginState,
    };

    fn manager(root: &Path) -> Arc<PluginManager> {
        let bundled = root.join("bundled");
        let plugin = bundled.join("webhook");
        std::fs::create_dir_all(&plugin).unwrap();
        std::fs::write(
            plugin.join(MANIFEST_FILE),
            r#"{"id":"webhook","name":"Webhook","type":"channel","entry_point":"webhook"}"#,
        )
        .unwrap();
        let config = PluginConfigStore::load(root.join("config.json")).unwrap();
        Arc::new(PluginManager::new(
            PluginDiscovery::from_locations(&bundled, &root.join("installed"), &[]),
            Arc::new(config),
            FactoryRegistry::new().with(WEBHOOK_ENTRY_POINT, Arc::new(WebhookFactory)),
            root.join("installed"),
        ))
    }

    async fn wait_for_state(manager: &PluginManager, id: &str, state: PluginState) -> bool {
        for _ in 0..100 {
            if manager.get(id).is_some_and(|s| s.state == state) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[test]
    fn test_watcher_starts_empty() {
        let watcher = ConfigWatcher::new();
        assert!(watcher.watched_paths().is_empty());
    }

    #[test]
    fn test_manual_trigger() {
        let watcher = ConfigWatcher::new();
        let mut rx = watcher.subscribe();
        watcher.trigger_reload();
        assert!(matches!(rx.try_recv(), Ok(ReloadEvent::Manual)));
    }

    #[test]
    fn test_watch_missing_dir_is_skipped() {
        let mut watcher = ConfigWatcher::new();
        watcher.watch_dir(PathBuf::from("/nonexistent/plugins")).unwrap();
        assert!(watcher.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_manual_reload_applies_enable() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        manager.orchestrate().await;
        assert_eq!(manager.get("webhook").unwrap().state, PluginState::Disabled);

        let watcher = ConfigWatcher::new();
        let reloader = spawn_reloader(
            Arc::clone(&manager),
            watcher.subscribe(),
            Duration::from_millis(20),
        );
        manager.enable("webhook").unwrap();
        watcher.trigger_reload();

        assert!(wait_for_state(&manager, "webhook", PluginState::Started).await);
        drop(watcher);
        reloader.await.unwrap();
    }

    #[tokio::test]
    async fn test_config_edit_triggers_pass() {
        let root = tempfile::tempdir().unwrap();
        let manager = manager(root.path());
        manager.orchestrate().await;

        let mut watcher = ConfigWatcher::new();
        watcher.watch_file(root.path().join("config.json")).unwrap();
        let _reloader = spawn_reloader(
            Arc::clone(&manager),
            watcher.subscribe(),
            Duration::from_millis(50),
        );

        std::fs::write(
            root.path().join("config.json"),
            r#"{"plugins":{"webhook":{"enabled":true}}}"#,
        )
        .unwrap();
        assert!(wait_for_state(&manager, "webhook", PluginState::Started).await);
    }
}
