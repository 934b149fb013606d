//! Persisted plugin configuration (`config.json`).
//!
//! ```json
//! { "plugins": { "webhook": { "enabled": true, "settings": { "reply_url": "..." } } } }
//! ```
//!
//! A plugin without an entry is disabled. Enable/disable only persist the
//! flag; the orchestrator applies it on its next pass.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-plugin persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// On-disk document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginConfigFile {
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSettings>,
}

/// File-backed plugin configuration.
pub struct PluginConfigStore {
    path: PathBuf,
    config: RwLock<PluginConfigFile>,
}

impl PluginConfigStore {
    /// Load the config file. A missing file is an empty config; a file that
    /// cannot be parsed is an error.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = read_file(&path)?;
        tracing::debug!(path = %path.display(), plugins = config.plugins.len(), "Loaded plugin config");
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file from disk. On error the previous contents are kept.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = read_file(&self.path)?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    pub fn snapshot(&self) -> PluginConfigFile {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_enabled(&self, id: &str) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .get(id)
            .is_some_and(|p| p.enabled)
    }

    pub fn settings(&self, id: &str) -> serde_json::Map<String, serde_json::Value> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .plugins
            .get(id)
            .map(|p| p.settings.clone())
            .unwrap_or_default()
    }

    /// Persist the enabled flag. Returns whether the value changed.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let entry = config.plugins.entry(id.to_string()).or_default();
        if entry.enabled == enabled {
            return Ok(false);
        }
        entry.enabled = enabled;
        write_file(&self.path, &config)?;
        tracing::info!(plugin = %id, enabled, "Plugin flag persisted");
        Ok(true)
    }

    /// Replace the settings object of one plugin.
    pub fn update_settings(
        &self,
        id: &str,
        settings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), ConfigError> {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        config.plugins.entry(id.to_string()).or_default().settings = settings;
        write_file(&self.path, &config)?;
        tracing::info!(plugin = %id, "Plugin settings persisted");
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<PluginConfigFile, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(PluginConfigFile::default());
        }
        Err(e) => return Err(e.into()),
    };
    if raw.trim().is_empty() {
        return Ok(PluginConfigFile::default());
    }
    serde_json::from_str(&raw)
        .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
}

/// Write via a sibling temp file and rename, so readers never see a torn file.
fn write_file(path: &Path, config: &PluginConfigFile) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(config)
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::load(dir.path().join("config.json")).unwrap();
        assert!(store.snapshot().plugins.is_empty());
        assert!(!store.is_enabled("webhook"));
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{\"plugins\": [").unwrap();
        assert!(matches!(
            PluginConfigStore::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_enable_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let store = PluginConfigStore::load(&path).unwrap();

        assert!(store.set_enabled("webhook", true).unwrap());
        assert!(!store.set_enabled("webhook", true).unwrap());
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let reopened = PluginConfigStore::load(&path).unwrap();
        assert!(reopened.is_enabled("webhook"));
    }

    #[test]
    fn test_update_settings_keeps_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = PluginConfigStore::load(dir.path().join("config.json")).unwrap();
        store.set_enabled("webhook", true).unwrap();

        let mut settings = serde_json::Map::new();
        settings.insert("reply_url".into(), "http://localhost:9000/reply".into());
        store.update_settings("webhook", settings).unwrap();

        assert!(store.is_enabled("webhook"));
        assert_eq!(
            store.settings("webhook")["reply_url"],
            "http://localhost:9000/reply"
        );
    }

    #[test]
    fn test_reload_picks_up_external_edit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = PluginConfigStore::load(&path).unwrap();
        std::fs::write(&path, r#"{"plugins":{"webhook":{"enabled":true}}}"#).unwrap();

        store.reload().unwrap();
        assert!(store.is_enabled("webhook"));

        std::fs::write(&path, "garbage").unwrap();
        assert!(store.reload().is_err());
        assert!(store.is_enabled("webhook"));
    }
}
