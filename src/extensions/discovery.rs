//! Plugin discovery across search locations.
//!
//! Each location is scanned in sorted directory order. Results are keyed by
//! plugin id, and when two locations provide the same id the one with the
//! higher [`PluginSource`] rank wins regardless of scan order. Within one
//! rank the first directory found wins and later ones are reported as
//! duplicates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::manifest::{MANIFEST_FILE, PluginManifest};
use crate::error::PluginError;

/// Where a plugin was found. Later variants take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginSource {
    Bundled,
    Installed,
    External,
}

impl std::fmt::Display for PluginSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bundled => write!(f, "bundled"),
            Self::Installed => write!(f, "installed"),
            Self::External => write!(f, "external"),
        }
    }
}

/// A plugin directory with a valid manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPlugin {
    pub manifest: PluginManifest,
    pub path: PathBuf,
    pub source: PluginSource,
}

/// One directory to scan for plugin subdirectories.
#[derive(Debug, Clone)]
pub struct SearchPath {
    pub path: PathBuf,
    pub source: PluginSource,
}

/// Scans search paths for `plugin.json` manifests.
#[derive(Debug, Clone, Default)]
pub struct PluginDiscovery {
    search_paths: Vec<SearchPath>,
}

impl PluginDiscovery {
    pub fn new(search_paths: Vec<SearchPath>) -> Self {
        Self { search_paths }
    }

    /// Standard layout: bundled, installed, then any external paths.
    pub fn from_locations(bundled: &Path, installed: &Path, external: &[PathBuf]) -> Self {
        let mut search_paths = vec![
            SearchPath {
                path: bundled.to_path_buf(),
                source: PluginSource::Bundled,
            },
            SearchPath {
                path: installed.to_path_buf(),
                source: PluginSource::Installed,
            },
        ];
        search_paths.extend(external.iter().map(|p| SearchPath {
            path: p.clone(),
            source: PluginSource::External,
        }));
        Self { search_paths }
    }

    pub fn search_paths(&self) -> &[SearchPath] {
        &self.search_paths
    }

    /// Discover every plugin, resolving duplicate ids by source rank.
    pub fn discover(&self) -> BTreeMap<String, DiscoveredPlugin> {
        let mut found: BTreeMap<String, DiscoveredPlugin> = BTreeMap::new();

        for search in &self.search_paths {
            for plugin in scan_directory(&search.path, search.source) {
                let id = plugin.manifest.id.clone();
                match found.get(&id) {
                    Some(existing) if existing.source > plugin.source => {
                        tracing::debug!(
                            plugin = %id,
                            kept = %existing.path.display(),
                            shadowed = %plugin.path.display(),
                            "Plugin shadowed by higher-precedence source"
                        );
                    }
                    Some(existing) if existing.source == plugin.source => {
                        tracing::warn!(
                            plugin = %id,
                            kept = %existing.path.display(),
                            skipped = %plugin.path.display(),
                            "Duplicate plugin id, keeping first found"
                        );
                    }
                    Some(existing) => {
                        tracing::info!(
                            plugin = %id,
                            from = %existing.source,
                            to = %plugin.source,
                            "Plugin overridden"
                        );
                        found.insert(id, plugin);
                    }
                    None => {
                        found.insert(id, plugin);
                    }
                }
            }
        }

        tracing::info!(count = found.len(), "Discovered plugins");
        found
    }

    /// Read a single plugin directory.
    pub fn discover_single(
        path: &Path,
        source: PluginSource,
    ) -> Result<DiscoveredPlugin, PluginError> {
        let manifest = PluginManifest::load(path)?;
        Ok(DiscoveredPlugin {
            manifest,
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Plugins directly below `root`, in sorted directory order.
fn scan_directory(root: &Path, source: PluginSource) -> Vec<DiscoveredPlugin> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %root.display(), error = %e, "Plugin search path not readable");
            return Vec::new();
        }
    };

    let mut dirs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.join(MANIFEST_FILE).is_file())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .filter_map(
            |dir| match PluginDiscovery::discover_single(&dir, source) {
                Ok(plugin) => {
                    tracing::debug!(plugin = %plugin.manifest.id, path = %dir.display(), "Found plugin");
                    Some(plugin)
                }
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Skipping invalid plugin");
                    None
                }
            },
        )
        .collect()
}
