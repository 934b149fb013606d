//! Host routing surface for channel inbound paths.
//!
//! Channel plugins claim a path under `/channels`. The table maps each
//! normalized path to the owning plugin id; the HTTP layer looks the owner
//! up per request so routes can change without rebuilding the router.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use crate::error::RegistrationError;

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<BTreeMap<String, String>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `path` for `plugin_id`.
    ///
    /// Re-registering the same path for the same plugin is a no-op and
    /// returns `Ok(false)`.
    pub fn register(&self, path: &str, plugin_id: &str) -> Result<bool, RegistrationError> {
        let path = normalize(path)?;
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.get(&path) {
            Some(owner) if owner == plugin_id => Ok(false),
            Some(owner) => Err(RegistrationError::PathConflict {
                path,
                owner: owner.clone(),
            }),
            None => {
                tracing::debug!(path = %path, plugin = %plugin_id, "Route registered");
                routes.insert(path, plugin_id.to_string());
                Ok(true)
            }
        }
    }

    /// Drop every path owned by `plugin_id`. Returns how many were removed.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let before = routes.len();
        routes.retain(|_, owner| owner != plugin_id);
        before - routes.len()
    }

    /// Owner of `path`, if any.
    pub fn resolve(&self, path: &str) -> Option<String> {
        let path = normalize(path).ok()?;
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .cloned()
    }

    pub fn paths_for(&self, plugin_id: &str) -> Vec<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, owner)| owner.as_str() == plugin_id)
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Leading slash, no trailing slash, no empty or dot segments.
fn normalize(path: &str) -> Result<String, RegistrationError> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(RegistrationError::InvalidPath(path.to_string()));
    }
    let valid = trimmed.split('/').all(|seg| {
        !seg.is_empty()
            && seg != "."
            && seg != ".."
            && seg
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    });
    if !valid {
        return Err(RegistrationError::InvalidPath(path.to_string()));
    }
    Ok(format!("/{trimmed}"))
}
