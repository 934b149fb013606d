//! Plugin manifest (`plugin.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// File name every plugin directory must contain.
pub const MANIFEST_FILE: &str = "plugin.json";

/// Version of the channel capability contract this host implements.
pub const CHANNEL_CONTRACT_VERSION: &str = "1";

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_contract() -> String {
    CHANNEL_CONTRACT_VERSION.to_string()
}

/// Kind of plugin declared by a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    Channel,
    Hook,
    Tool,
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel => write!(f, "channel"),
            Self::Hook => write!(f, "hook"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// Metadata describing one plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique kebab-case identifier.
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Name of the compiled-in factory that builds the plugin.
    pub entry_point: String,
    /// Capability contract version the plugin was written against.
    #[serde(default = "default_contract")]
    pub contract: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<serde_json::Value>,
}

impl PluginManifest {
    /// Read and validate `plugin.json` inside `dir`.
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        let path = dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| PluginError::InvalidManifest {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let manifest: Self =
            serde_json::from_str(&raw).map_err(|e| PluginError::InvalidManifest {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        manifest
            .validate()
            .map_err(|reason| PluginError::InvalidManifest { path, reason })?;
        Ok(manifest)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if !is_kebab_case(&self.id) {
            return Err(format!("id '{}' must be kebab-case", self.id));
        }
        if self.name.trim().is_empty() {
            return Err("name cannot be empty".to_string());
        }
        if self.entry_point.trim().is_empty() {
            return Err("entry_point cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Lowercase ASCII words joined by single hyphens.
pub fn is_kebab_case(id: &str) -> bool {
    !id.is_empty()
        && id.split('-').all(|part| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn test_kebab_case() {
        assert!(is_kebab_case("webhook"));
        assert!(is_kebab_case("my-channel-2"));
        assert!(!is_kebab_case("My-Channel"));
        assert!(!is_kebab_case("double--dash"));
        assert!(!is_kebab_case("-leading"));
        assert!(!is_kebab_case("snake_case"));
        assert!(!is_kebab_case(""));
    }

    #[test]
    fn test_load_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"id":"webhook","name":"Webhook","type":"channel","entry_point":"webhook"}"#,
        );
        let manifest = PluginManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.contract, CHANNEL_CONTRACT_VERSION);
        assert_eq!(manifest.plugin_type, PluginType::Channel);
        assert!(manifest.config_schema.is_none());
    }

    #[test]
    fn test_load_rejects_bad_id() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"id":"Bad_Id","name":"x","type":"channel","entry_point":"x"}"#,
        );
        let err = PluginManifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest { ref reason, .. } if reason.contains("kebab-case")));
    }

    #[test]
    fn test_load_rejects_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{"id":"x","name":"x","type":"widget","entry_point":"x"}"#,
        );
        assert!(matches!(
            PluginManifest::load(dir.path()),
            Err(PluginError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(PluginManifest::load(dir.path()).is_err());
    }
}
