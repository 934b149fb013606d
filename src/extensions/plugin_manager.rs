//! Plugin lifecycle manager.
//!
//! Drives every discovered plugin through
//! `Discovered -> Loaded -> Registered -> Started`, isolating failures per
//! plugin. An orchestration pass re-reads the persisted config, rediscovers
//! the search paths and reconciles the table against them:
//!
//! - unchanged started plugins are left alone (passes are idempotent);
//! - plugins disabled since the last pass are stopped and unrouted;
//! - failed plugins are retried;
//! - plugins whose directory disappeared are stopped and dropped.
//!
//! The plugin table lock is only held to read or write entries; plugin
//! hooks (`start`, `stop`, `health_check`, `accept`) always run unlocked.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::config_store::PluginConfigStore;
use super::discovery::{DiscoveredPlugin, PluginDiscovery, PluginSource};
use super::manifest::{CHANNEL_CONTRACT_VERSION, PluginType};
use super::routes::RouteTable;
use crate::channels::{
    ChannelBridge, ChannelFactory, ChannelPlugin, DispatchOutcome, InboundAck, InboundRequest,
    PluginContext,
};
use crate::error::{ChannelError, LoadError, PluginError};

/// Request timeout of the HTTP client shared with plugins.
pub const PLUGIN_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle state of one plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Discovered,
    Loaded,
    Registered,
    Started,
    Stopped,
    Disabled,
    Failed,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::Loaded => "loaded",
            Self::Registered => "registered",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Disabled => "disabled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Lifecycle step that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStage {
    Load,
    Register,
    Start,
    Stop,
}

/// Compiled-in channel factories keyed by entry point name.
#[derive(Default, Clone)]
pub struct FactoryRegistry {
    factories: HashMap<String, Arc<dyn ChannelFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry_point: impl Into<String>, factory: Arc<dyn ChannelFactory>) {
        self.factories.insert(entry_point.into(), factory);
    }

    pub fn with(mut self, entry_point: impl Into<String>, factory: Arc<dyn ChannelFactory>) -> Self {
        self.register(entry_point, factory);
        self
    }

    pub fn get(&self, entry_point: &str) -> Option<Arc<dyn ChannelFactory>> {
        self.factories.get(entry_point).cloned()
    }

    pub fn contains(&self, entry_point: &str) -> bool {
        self.factories.contains_key(entry_point)
    }

    pub fn entry_points(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Internal plugin entry with status tracking.
struct PluginEntry {
    plugin: DiscoveredPlugin,
    state: PluginState,
    enabled: bool,
    instance: Option<Arc<dyn ChannelPlugin>>,
    error: Option<String>,
    failed_stage: Option<LifecycleStage>,
    started_at: Option<DateTime<Utc>>,
}

impl PluginEntry {
    fn new(plugin: DiscoveredPlugin, enabled: bool) -> Self {
        Self {
            plugin,
            state: PluginState::Discovered,
            enabled,
            instance: None,
            error: None,
            failed_stage: None,
            started_at: None,
        }
    }

    fn snapshot(&self) -> PluginSnapshot {
        let manifest = &self.plugin.manifest;
        PluginSnapshot {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            description: manifest.description.clone(),
            plugin_type: manifest.plugin_type,
            source: self.plugin.source,
            state: self.state,
            enabled: self.enabled,
            started_at: self.started_at.map(|t| t.to_rfc3339()),
            error: self.error.clone(),
            failed_stage: self.failed_stage,
        }
    }
}

/// Snapshot of a plugin's state.
#[derive(Debug, Clone, Serialize)]
pub struct PluginSnapshot {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    pub source: PluginSource,
    pub state: PluginState,
    pub enabled: bool,
    pub started_at: Option<String>,
    pub error: Option<String>,
    pub failed_stage: Option<LifecycleStage>,
}

/// Detailed view of one plugin for the management surface.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    #[serde(flatten)]
    pub snapshot: PluginSnapshot,
    pub path: PathBuf,
    pub entry_point: String,
    pub contract: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub config_schema: Option<serde_json::Value>,
    pub routes: Vec<String>,
}

/// Counts per lifecycle state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginSummary {
    pub total: usize,
    pub started: usize,
    pub disabled: usize,
    pub failed: usize,
    pub by_state: BTreeMap<String, usize>,
}

/// Result of a health check.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub id: String,
    pub state: PluginState,
    pub healthy: bool,
    pub detail: Option<String>,
}

/// What one orchestration pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrchestrationReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
    pub disabled: Vec<String>,
    pub unchanged: Vec<String>,
    pub removed: Vec<String>,
}

/// Manages all discovered plugins.
pub struct PluginManager {
    discovery: PluginDiscovery,
    config: Arc<PluginConfigStore>,
    factories: FactoryRegistry,
    routes: Arc<RouteTable>,
    bridge: RwLock<Option<Arc<dyn ChannelBridge>>>,
    http: reqwest::Client,
    installed_dir: PathBuf,
    plugins: RwLock<BTreeMap<String, PluginEntry>>,
    pass: Mutex<()>,
}

impl PluginManager {
    pub fn new(
        discovery: PluginDiscovery,
        config: Arc<PluginConfigStore>,
        factories: FactoryRegistry,
        installed_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            discovery,
            config,
            factories,
            routes: Arc::new(RouteTable::new()),
            bridge: RwLock::new(None),
            http: reqwest::Client::builder()
                .timeout(PLUGIN_HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            installed_dir: installed_dir.into(),
            plugins: RwLock::new(BTreeMap::new()),
            pass: Mutex::new(()),
        }
    }

    /// Host side that receives dispatched inbound messages.
    pub fn set_bridge(&self, bridge: Arc<dyn ChannelBridge>) {
        *self.bridge.write().unwrap_or_else(PoisonError::into_inner) = Some(bridge);
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn config(&self) -> &Arc<PluginConfigStore> {
        &self.config
    }

    // --- Orchestration ---

    /// Run discover -> load -> register -> start for the current plugin set.
    pub async fn orchestrate(&self) -> OrchestrationReport {
        let _pass = self.pass.lock().await;
        let mut report = OrchestrationReport::default();

        if let Err(e) = self.config.reload() {
            tracing::warn!(error = %e, "Plugin config unreadable, keeping previous values");
        }
        let discovered = self.discovery.discover();

        // Plugins whose directory vanished.
        let vanished: Vec<String> = self
            .read()
            .keys()
            .filter(|id| !discovered.contains_key(*id))
            .cloned()
            .collect();
        for id in vanished {
            self.shutdown(&id).await;
            self.write().remove(&id);
            tracing::info!(plugin = %id, "Plugin removed");
            report.removed.push(id);
        }

        for (id, plugin) in discovered {
            let enabled = self.config.is_enabled(&id);
            let (state, same_plugin) = match self.read().get(&id) {
                Some(entry) => (Some(entry.state), entry.plugin == plugin),
                None => (None, false),
            };

            match state {
                Some(PluginState::Started) if enabled && same_plugin => {
                    report.unchanged.push(id);
                    continue;
                }
                Some(PluginState::Started) => {
                    self.shutdown(&id).await;
                    if !enabled {
                        self.update(&id, |e| e.enabled = false);
                        report.stopped.push(id);
                        continue;
                    }
                    tracing::info!(plugin = %id, "Plugin changed on disk, restarting");
                }
                Some(PluginState::Stopped | PluginState::Disabled) if !enabled && same_plugin => {
                    report.unchanged.push(id);
                    continue;
                }
                _ => {}
            }

            if !enabled {
                self.write().insert(id.clone(), {
                    let mut entry = PluginEntry::new(plugin, false);
                    entry.state = PluginState::Disabled;
                    entry
                });
                tracing::debug!(plugin = %id, "Plugin disabled, skipping");
                report.disabled.push(id);
                continue;
            }

            self.write()
                .insert(id.clone(), PluginEntry::new(plugin.clone(), true));
            match self.bring_up(&id, &plugin).await {
                Ok(()) => report.started.push(id),
                Err(e) => {
                    tracing::error!(plugin = %id, error = %e, "Plugin failed");
                    report.failed.push(id);
                }
            }
        }

        tracing::info!(
            started = report.started.len(),
            unchanged = report.unchanged.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            disabled = report.disabled.len(),
            "Plugin orchestration pass complete"
        );
        report
    }

    /// Load, register and start one enabled plugin.
    async fn bring_up(&self, id: &str, plugin: &DiscoveredPlugin) -> Result<(), PluginError> {
        let instance = match self.load(plugin) {
            Ok(instance) => instance,
            Err(source) => {
                let err = PluginError::Load {
                    id: id.to_string(),
                    source,
                };
                self.fail(id, LifecycleStage::Load, &err);
                return Err(err);
            }
        };
        self.update(id, |e| {
            e.instance = Some(Arc::clone(&instance));
            e.state = PluginState::Loaded;
        });
        tracing::info!(plugin = %id, "Loaded plugin");

        if let Err(source) = self.routes.register(&instance.meta().inbound_path, id) {
            let err = PluginError::Registration {
                id: id.to_string(),
                source,
            };
            self.fail(id, LifecycleStage::Register, &err);
            return Err(err);
        }
        self.update(id, |e| e.state = PluginState::Registered);
        tracing::info!(plugin = %id, path = %instance.meta().inbound_path, "Registered plugin");

        if let Err(e) = instance.start().await {
            self.routes.unregister_plugin(id);
            let err = PluginError::Start {
                id: id.to_string(),
                reason: e.to_string(),
            };
            self.fail(id, LifecycleStage::Start, &err);
            return Err(err);
        }
        self.update(id, |e| {
            e.state = PluginState::Started;
            e.started_at = Some(Utc::now());
            e.error = None;
            e.failed_stage = None;
        });
        tracing::info!(plugin = %id, "Started plugin");
        Ok(())
    }

    /// Resolve the entry point and build the plugin instance.
    fn load(&self, plugin: &DiscoveredPlugin) -> Result<Arc<dyn ChannelPlugin>, LoadError> {
        let manifest = &plugin.manifest;
        if manifest.plugin_type != PluginType::Channel {
            return Err(LoadError::ContractMismatch {
                reason: format!("plugin type '{}' is not loadable", manifest.plugin_type),
            });
        }
        if manifest.contract != CHANNEL_CONTRACT_VERSION {
            return Err(LoadError::ContractMismatch {
                reason: format!(
                    "manifest targets contract {}, host implements {}",
                    manifest.contract, CHANNEL_CONTRACT_VERSION
                ),
            });
        }
        let factory =
            self.factories
                .get(&manifest.entry_point)
                .ok_or_else(|| LoadError::EntryPointNotFound {
                    entry_point: manifest.entry_point.clone(),
                })?;
        if factory.contract() != CHANNEL_CONTRACT_VERSION {
            return Err(LoadError::ContractMismatch {
                reason: format!(
                    "entry point {} implements contract {}",
                    manifest.entry_point,
                    factory.contract()
                ),
            });
        }

        let instance = factory.create(PluginContext {
            plugin_id: manifest.id.clone(),
            settings: self.config.settings(&manifest.id),
            http: self.http.clone(),
        })?;
        if instance.meta().id != manifest.id {
            return Err(LoadError::ContractMismatch {
                reason: format!(
                    "instance reports id {} for plugin {}",
                    instance.meta().id,
                    manifest.id
                ),
            });
        }
        Ok(instance)
    }

    /// Stop a started plugin and remove its routes. Other states only lose
    /// their routes.
    async fn shutdown(&self, id: &str) {
        let instance = {
            let plugins = self.read();
            plugins
                .get(id)
                .filter(|e| e.state == PluginState::Started)
                .and_then(|e| e.instance.clone())
        };
        self.routes.unregister_plugin(id);

        let Some(instance) = instance else {
            return;
        };
        match instance.stop().await {
            Ok(()) => {
                tracing::info!(plugin = %id, "Stopped plugin");
                self.update(id, |e| {
                    e.state = PluginState::Stopped;
                    e.instance = None;
                    e.started_at = None;
                });
            }
            Err(err) => {
                tracing::warn!(plugin = %id, error = %err, "Plugin stop hook failed");
                self.update(id, |e| {
                    e.state = PluginState::Stopped;
                    e.instance = None;
                    e.started_at = None;
                    e.error = Some(err.to_string());
                    e.failed_stage = Some(LifecycleStage::Stop);
                });
            }
        }
    }

    /// Stop every started plugin.
    pub async fn stop_all(&self) {
        let _pass = self.pass.lock().await;
        let started: Vec<String> = self
            .read()
            .iter()
            .filter(|(_, e)| e.state == PluginState::Started)
            .map(|(id, _)| id.clone())
            .collect();
        for id in started {
            self.shutdown(&id).await;
        }
    }

    // --- Management ---

    /// All known plugins, ordered by id.
    pub fn list(&self) -> Vec<PluginSnapshot> {
        self.read().values().map(PluginEntry::snapshot).collect()
    }

    pub fn get(&self, id: &str) -> Option<PluginSnapshot> {
        self.read().get(id).map(PluginEntry::snapshot)
    }

    pub fn info(&self, id: &str) -> Result<PluginInfo, PluginError> {
        let plugins = self.read();
        let entry = plugins
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        Ok(PluginInfo {
            snapshot: entry.snapshot(),
            path: entry.plugin.path.clone(),
            entry_point: entry.plugin.manifest.entry_point.clone(),
            contract: entry.plugin.manifest.contract.clone(),
            settings: self.config.settings(id),
            config_schema: entry.plugin.manifest.config_schema.clone(),
            routes: self.routes.paths_for(id),
        })
    }

    /// Persist the enabled flag. Takes effect on the next pass.
    pub fn enable(&self, id: &str) -> Result<bool, PluginError> {
        self.ensure_known(id)?;
        Ok(self.config.set_enabled(id, true)?)
    }

    /// Persist the disabled flag. Takes effect on the next pass.
    pub fn disable(&self, id: &str) -> Result<bool, PluginError> {
        self.ensure_known(id)?;
        Ok(self.config.set_enabled(id, false)?)
    }

    pub fn update_settings(
        &self,
        id: &str,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), PluginError> {
        self.ensure_known(id)?;
        Ok(self.config.update_settings(id, settings)?)
    }

    /// Copy a plugin directory into the installed location.
    ///
    /// The plugin is picked up by the next pass. Installing over an existing
    /// installed plugin of the same id is refused.
    pub fn install(&self, source_dir: &Path) -> Result<DiscoveredPlugin, PluginError> {
        let candidate = PluginDiscovery::discover_single(source_dir, PluginSource::Installed)?;
        let id = candidate.manifest.id.clone();
        let dest = self.installed_dir.join(&id);
        if dest.exists() {
            return Err(PluginError::AlreadyInstalled(id));
        }
        copy_dir(source_dir, &dest)?;
        tracing::info!(plugin = %id, path = %dest.display(), "Installed plugin");
        Ok(DiscoveredPlugin {
            path: dest,
            ..candidate
        })
    }

    pub async fn health_check(&self, id: &str) -> Result<HealthReport, PluginError> {
        let (state, instance, error) = {
            let plugins = self.read();
            let entry = plugins
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            (entry.state, entry.instance.clone(), entry.error.clone())
        };

        let (healthy, detail) = match (state, instance) {
            (PluginState::Started, Some(instance)) => match instance.health_check().await {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            },
            (PluginState::Failed, _) => (false, error),
            (state, _) => (false, Some(format!("plugin is {state}"))),
        };
        Ok(HealthReport {
            id: id.to_string(),
            state,
            healthy,
            detail,
        })
    }

    pub fn summary(&self) -> PluginSummary {
        let plugins = self.read();
        let mut summary = PluginSummary {
            total: plugins.len(),
            ..PluginSummary::default()
        };
        for entry in plugins.values() {
            *summary.by_state.entry(entry.state.to_string()).or_default() += 1;
            match entry.state {
                PluginState::Started => summary.started += 1,
                PluginState::Disabled => summary.disabled += 1,
                PluginState::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary
    }

    /// Started channel instance for `id`.
    pub fn channel(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.read()
            .get(id)
            .filter(|e| e.state == PluginState::Started)
            .and_then(|e| e.instance.clone())
    }

    // --- Inbound routing ---

    /// Route one inbound request to the owning channel.
    pub async fn handle_inbound(
        &self,
        request: InboundRequest,
    ) -> Result<serde_json::Value, PluginError> {
        let id = self
            .routes
            .resolve(&request.path)
            .ok_or_else(|| PluginError::NotFound(request.path.clone()))?;
        let channel = self
            .channel(&id)
            .ok_or_else(|| ChannelError::NotAccepting { name: id.clone() })?;

        match channel.accept(request).await? {
            InboundAck::Respond(body) => Ok(body),
            InboundAck::Ignore { reason } => {
                tracing::debug!(plugin = %id, reason = %reason, "Inbound request ignored");
                Ok(serde_json::json!({ "status": "ignored", "reason": reason }))
            }
            InboundAck::Dispatch(message) => {
                let bridge = self
                    .bridge
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
                    .ok_or_else(|| ChannelError::NotAccepting { name: id.clone() })?;
                let outcome: DispatchOutcome = bridge.dispatch(channel, message).await?;
                Ok(serde_json::to_value(outcome).unwrap_or_else(|_| serde_json::json!({})))
            }
        }
    }

    // --- Internals ---

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, PluginEntry>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, PluginEntry>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut PluginEntry)) {
        if let Some(entry) = self.write().get_mut(id) {
            f(entry);
        }
    }

    fn fail(&self, id: &str, stage: LifecycleStage, err: &PluginError) {
        self.update(id, |e| {
            e.state = PluginState::Failed;
            e.instance = None;
            e.error = Some(err.to_string());
            e.failed_stage = Some(stage);
        });
    }

    fn ensure_known(&self, id: &str) -> Result<(), PluginError> {
        if self.read().contains_key(id) {
            return Ok(());
        }
        // Not orchestrated yet; fall back to the search paths.
        if self.discovery.discover().contains_key(id) {
            return Ok(());
        }
        Err(PluginError::NotFound(id.to_string()))
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{ChannelMeta, InboundMessage, OutboundReply};
    use crate::extensions::discovery::tests::write_plugin;

    /// Test channel with switchable failures and call counters.
    struct FakeChannel {
        meta: ChannelMeta,
        fail_start: bool,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelPlugin for FakeChannel {
        fn meta(&self) -> &ChannelMeta {
            &self.meta
        }

        async fn accept(&self, request: InboundRequest) -> Result<InboundAck, ChannelError> {
            let body: serde_json::Value = serde_json::from_slice(&request.body)
                .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
            Ok(InboundAck::Respond(body))
        }

        async fn send(&self, _reply: OutboundReply) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), ChannelError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(ChannelError::StartupFailed {
                    name: self.meta.id.clone(),
                    reason: "port busy".to_string(),
                });
            }
            Ok(())
        }

        async fn stop(&self) -> Result<(), ChannelError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        fail_start: bool,
        /// Fixed inbound path; defaults to `/<plugin id>`.
        path: Option<String>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        creates: AtomicUsize,
    }

    impl ChannelFactory for FakeFactory {
        fn contract(&self) -> &str {
            CHANNEL_CONTRACT_VERSION
        }

        fn create(&self, context: PluginContext) -> Result<Arc<dyn ChannelPlugin>, ChannelError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeChannel {
                meta: ChannelMeta {
                    id: context.plugin_id.clone(),
                    name: context.plugin_id.clone(),
                    inbound_path: self
                        .path
                        .clone()
                        .unwrap_or_else(|| format!("/{}", context.plugin_id)),
                    description: String::new(),
                },
                fail_start: self.fail_start,
                starts: Arc::clone(&self.starts),
                stops: Arc::clone(&self.stops),
            }))
        }
    }

    struct Fixture {
        _bundled: tempfile::TempDir,
        installed: tempfile::TempDir,
        _config_dir: tempfile::TempDir,
        bundled_path: PathBuf,
        manager: PluginManager,
        good: Arc<FakeFactory>,
    }

    fn fixture(plugins: &[(&str, &str)], factories: FactoryRegistry) -> Fixture {
        let bundled = tempfile::tempdir().unwrap();
        let installed = tempfile::tempdir().unwrap();
        let config_dir = tempfile::tempdir().unwrap();
        for (id, entry_point) in plugins {
            write_plugin(bundled.path(), id, id, entry_point);
        }

        let config = Arc::new(PluginConfigStore::load(config_dir.path().join("config.json")).unwrap());
        for (id, _) in plugins {
            config.set_enabled(id, true).unwrap();
        }

        let good = Arc::new(FakeFactory::default());
        let factories = factories.with("good", good.clone());
        let manager = PluginManager::new(
            PluginDiscovery::from_locations(bundled.path(), installed.path(), &[]),
            config,
            factories,
            installed.path(),
        );
        Fixture {
            bundled_path: bundled.path().to_path_buf(),
            _bundled: bundled,
            installed,
            _config_dir: config_dir,
            manager,
            good,
        }
    }

    // --- Orchestration ---

    #[tokio::test]
    async fn test_orchestrate_starts_enabled_plugins() {
        let fx = fixture(&[("alpha", "good"), ("beta", "good")], FactoryRegistry::new());
        let report = fx.manager.orchestrate().await;

        assert_eq!(report.started, ["alpha", "beta"]);
        assert_eq!(fx.manager.get("alpha").unwrap().state, PluginState::Started);
        assert_eq!(fx.manager.routes().resolve("/beta").as_deref(), Some("beta"));
        assert!(fx.manager.channel("alpha").is_some());
    }

    #[tokio::test]
    async fn test_load_failure_does_not_block_sibling() {
        let fx = fixture(&[("broken", "missing"), ("working", "good")], FactoryRegistry::new());
        let report = fx.manager.orchestrate().await;

        assert_eq!(report.failed, ["broken"]);
        assert_eq!(report.started, ["working"]);

        let broken = fx.manager.info("broken").unwrap();
        assert_eq!(broken.snapshot.state, PluginState::Failed);
        assert_eq!(broken.snapshot.failed_stage, Some(LifecycleStage::Load));
        assert!(broken.snapshot.error.unwrap().contains("missing"));
        assert_eq!(fx.manager.get("working").unwrap().state, PluginState::Started);
    }

    #[tokio::test]
    async fn test_start_failure_is_isolated_and_unrouted() {
        let failing = Arc::new(FakeFactory {
            fail_start: true,
            ..FakeFactory::default()
        });
        let fx = fixture(
            &[("flaky", "failing"), ("steady", "good")],
            FactoryRegistry::new().with("failing", failing.clone()),
        );
        let report = fx.manager.orchestrate().await;

        assert_eq!(report.failed, ["flaky"]);
        assert_eq!(report.started, ["steady"]);
        assert_eq!(
            fx.manager.get("flaky").unwrap().failed_stage,
            Some(LifecycleStage::Start)
        );
        assert!(fx.manager.routes().resolve("/flaky").is_none());

        // Failed plugins are retried on the next pass.
        fx.manager.orchestrate().await;
        assert_eq!(failing.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_path_conflict_is_registration_failure() {
        let shared = Arc::new(FakeFactory {
            path: Some("/shared".to_string()),
            ..FakeFactory::default()
        });
        let fx = fixture(
            &[("first", "shared"), ("second", "shared")],
            FactoryRegistry::new().with("shared", shared),
        );
        let report = fx.manager.orchestrate().await;

        assert_eq!(report.started, ["first"]);
        assert_eq!(report.failed, ["second"]);
        assert_eq!(
            fx.manager.get("second").unwrap().failed_stage,
            Some(LifecycleStage::Register)
        );
        assert_eq!(fx.manager.routes().resolve("/shared").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_orchestrate_is_idempotent() {
        let fx = fixture(&[("alpha", "good"), ("beta", "missing")], FactoryRegistry::new());
        fx.manager.orchestrate().await;
        let before: Vec<_> = fx.manager.list().iter().map(|s| (s.id.clone(), s.state)).collect();

        let report = fx.manager.orchestrate().await;
        let after: Vec<_> = fx.manager.list().iter().map(|s| (s.id.clone(), s.state)).collect();

        assert_eq!(before, after);
        assert_eq!(report.unchanged, ["alpha"]);
        assert_eq!(fx.good.creates.load(Ordering::SeqCst), 1);
        assert_eq!(fx.good.starts.load(Ordering::SeqCst), 1);
        assert_eq!(fx.manager.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_disable_applies_on_next_pass() {
        let fx = fixture(&[("alpha", "good")], FactoryRegistry::new());
        fx.manager.orchestrate().await;

        assert!(fx.manager.disable("alpha").unwrap());
        // Not live: still started until the next pass.
        assert_eq!(fx.manager.get("alpha").unwrap().state, PluginState::Started);

        let report = fx.manager.orchestrate().await;
        assert_eq!(report.stopped, ["alpha"]);
        let snap = fx.manager.get("alpha").unwrap();
        assert_eq!(snap.state, PluginState::Stopped);
        assert!(!snap.enabled);
        assert!(fx.manager.routes().is_empty());
        assert_eq!(fx.good.stops.load(Ordering::SeqCst), 1);

        fx.manager.enable("alpha").unwrap();
        let report = fx.manager.orchestrate().await;
        assert_eq!(report.started, ["alpha"]);
    }

    #[tokio::test]
    async fn test_never_enabled_plugin_is_disabled() {
        let fx = fixture(&[], FactoryRegistry::new());
        write_plugin(&fx.bundled_path, "quiet", "quiet", "good");
        let report = fx.manager.orchestrate().await;

        assert_eq!(report.disabled, ["quiet"]);
        assert_eq!(fx.manager.get("quiet").unwrap().state, PluginState::Disabled);
        assert_eq!(fx.good.creates.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_channel_type_is_contract_mismatch() {
        let fx = fixture(&[], FactoryRegistry::new());
        let dir = fx.bundled_path.join("hooky");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("plugin.json"),
            r#"{"id":"hooky","name":"Hooky","type":"hook","entry_point":"good"}"#,
        )
        .unwrap();
        fx.manager.config().set_enabled("hooky", true).unwrap();

        let report = fx.manager.orchestrate().await;
        assert_eq!(report.failed, ["hooky"]);
        assert!(fx.manager.get("hooky").unwrap().error.unwrap().contains("not loadable"));
    }

    #[tokio::test]
    async fn test_vanished_plugin_is_stopped_and_removed() {
        let fx = fixture(&[("alpha", "good")], FactoryRegistry::new());
        fx.manager.orchestrate().await;

        std::fs::remove_dir_all(fx.bundled_path.join("alpha")).unwrap();
        let report = fx.manager.orchestrate().await;
        assert_eq!(report.removed, ["alpha"]);
        assert!(fx.manager.get("alpha").is_none());
        assert_eq!(fx.good.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_all() {
        let fx = fixture(&[("alpha", "good"), ("beta", "good")], FactoryRegistry::new());
        fx.manager.orchestrate().await;
        fx.manager.stop_all().await;

        assert!(fx.manager.list().iter().all(|s| s.state == PluginState::Stopped));
        assert!(fx.manager.routes().is_empty());
    }

    // --- Management ---

    #[tokio::test]
    async fn test_enable_unknown_plugin() {
        let fx = fixture(&[], FactoryRegistry::new());
        assert!(matches!(
            fx.manager.enable("ghost"),
            Err(PluginError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let fx = fixture(&[("a", "good"), ("b", "missing")], FactoryRegistry::new());
        write_plugin(&fx.bundled_path, "c", "c", "good");
        fx.manager.orchestrate().await;

        let summary = fx.manager.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.started, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.disabled, 1);
        assert_eq!(summary.by_state.get("started"), Some(&1));
    }

    #[tokio::test]
    async fn test_health_check_reports_state() {
        let fx = fixture(&[("a", "good"), ("b", "missing")], FactoryRegistry::new());
        fx.manager.orchestrate().await;

        let healthy = fx.manager.health_check("a").await.unwrap();
        assert!(healthy.healthy);

        let failed = fx.manager.health_check("b").await.unwrap();
        assert!(!failed.healthy);
        assert_eq!(failed.state, PluginState::Failed);

        assert!(fx.manager.health_check("ghost").await.is_err());
    }

    #[tokio::test]
    async fn test_install_copies_and_refuses_duplicates() {
        let fx = fixture(&[], FactoryRegistry::new());
        let src = tempfile::tempdir().unwrap();
        let plugin_dir = write_plugin(src.path(), "pkg", "fresh", "good");
        std::fs::write(plugin_dir.join("README.md"), "hello").unwrap();

        let installed = fx.manager.install(&plugin_dir).unwrap();
        assert_eq!(installed.source, PluginSource::Installed);
        assert!(fx.installed.path().join("fresh").join("README.md").exists());

        assert!(matches!(
            fx.manager.install(&plugin_dir),
            Err(PluginError::AlreadyInstalled(ref id)) if id == "fresh"
        ));

        fx.manager.enable("fresh").unwrap();
        let report = fx.manager.orchestrate().await;
        assert_eq!(report.started, ["fresh"]);
    }

    #[tokio::test]
    async fn test_info_includes_settings_and_routes() {
        let fx = fixture(&[("alpha", "good")], FactoryRegistry::new());
        let mut settings = serde_json::Map::new();
        settings.insert("token".into(), "abc".into());
        fx.manager.orchestrate().await;
        fx.manager.update_settings("alpha", settings).unwrap();

        let info = fx.manager.info("alpha").unwrap();
        assert_eq!(info.settings["token"], "abc");
        assert_eq!(info.routes, ["/alpha"]);
        assert_eq!(info.entry_point, "good");

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["state"], "started");
        assert_eq!(json["type"], "channel");
        assert_eq!(json["source"], "bundled");
    }

    // --- Inbound routing ---

    struct RecordingBridge {
        messages: std::sync::Mutex<Vec<InboundMessage>>,
    }

    #[async_trait]
    impl ChannelBridge for RecordingBridge {
        async fn dispatch(
            &self,
            _channel: Arc<dyn ChannelPlugin>,
            message: InboundMessage,
        ) -> Result<DispatchOutcome, ChannelError> {
            self.messages.lock().unwrap().push(message);
            Ok(DispatchOutcome::Accepted)
        }
    }

    #[tokio::test]
    async fn test_handle_inbound_routes_by_path() {
        let fx = fixture(&[("alpha", "good")], FactoryRegistry::new());
        fx.manager.orchestrate().await;
        fx.manager.set_bridge(Arc::new(RecordingBridge {
            messages: std::sync::Mutex::new(Vec::new()),
        }));

        let body = serde_json::json!({"challenge": "xyz"});
        let response = fx
            .manager
            .handle_inbound(InboundRequest::json("/alpha", &body))
            .await
            .unwrap();
        assert_eq!(response, body);

        let missing = fx
            .manager
            .handle_inbound(InboundRequest::json("/nobody", &body))
            .await;
        assert!(matches!(missing, Err(PluginError::NotFound(_))));
    }
}
