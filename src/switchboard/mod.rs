//! Live-switchable provider configuration.
//!
//! The set of known providers is fixed at construction. Exactly one of them
//! is active at any instant, held behind a single swappable `Arc`. Readers
//! take a snapshot once per invocation; a later switch never reaches an
//! invocation that already holds its snapshot.

mod provider;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use crate::error::ConfigError;

pub use provider::{ProviderConfig, builtin_providers, load_providers_file};

/// Listing entry for the management surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderSummary {
    pub name: String,
    pub description: String,
    pub base_url: String,
    pub is_active: bool,
    pub credential_present: bool,
}

/// Holds the named provider configs and the active pointer.
pub struct Switchboard {
    configs: BTreeMap<String, Arc<ProviderConfig>>,
    active: RwLock<Arc<ProviderConfig>>,
    generation: AtomicU64,
}

impl Switchboard {
    /// Build a switchboard and activate `default`.
    ///
    /// An unknown default falls back to the first config by name. The
    /// initial activation only checks the endpoint, so the relay can start
    /// before credentials are provisioned.
    pub fn new(configs: Vec<ProviderConfig>, default: &str) -> Result<Self, ConfigError> {
        let configs: BTreeMap<String, Arc<ProviderConfig>> = configs
            .into_iter()
            .map(|c| (c.name.clone(), Arc::new(c)))
            .collect();

        let initial = match configs.get(default) {
            Some(config) => Arc::clone(config),
            None => {
                let (name, config) =
                    configs
                        .iter()
                        .next()
                        .ok_or_else(|| ConfigError::InvalidValue {
                            key: "providers".to_string(),
                            message: "at least one provider config is required".to_string(),
                        })?;
                tracing::warn!(
                    requested = %default,
                    fallback = %name,
                    "Unknown default provider config, falling back"
                );
                Arc::clone(config)
            }
        };

        initial.validate_endpoint()?;
        if initial.credential().is_none() {
            tracing::warn!(
                provider = %initial.name,
                env = %initial.auth_token_env,
                "Active provider has no credential yet"
            );
        }
        tracing::info!(provider = %initial.name, "Provider config active");

        Ok(Self {
            configs,
            active: RwLock::new(initial),
            generation: AtomicU64::new(0),
        })
    }

    /// Snapshot of the active config.
    pub fn get_active(&self) -> Arc<ProviderConfig> {
        Arc::clone(&self.active.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn active_name(&self) -> String {
        self.get_active().name.clone()
    }

    /// Atomically make `name` the active config.
    ///
    /// Rejected switches leave the active config untouched.
    pub fn switch(&self, name: &str) -> Result<Arc<ProviderConfig>, ConfigError> {
        let config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownConfig {
                name: name.to_string(),
            })?;
        config.validate()?;

        let previous = {
            let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
            self.generation.fetch_add(1, Ordering::SeqCst);
            std::mem::replace(&mut *active, Arc::clone(&config))
        };

        tracing::info!(from = %previous.name, to = %config.name, "Switched provider config");
        Ok(config)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderConfig>> {
        self.configs.get(name).cloned()
    }

    /// All known configs in name order.
    pub fn list(&self) -> Vec<ProviderSummary> {
        let active = self.get_active();
        self.configs
            .values()
            .map(|c| ProviderSummary {
                name: c.name.clone(),
                description: c.description.clone(),
                base_url: c.base_url.clone(),
                is_active: c.name == active.name,
                credential_present: c.credential().is_some(),
            })
            .collect()
    }

    /// Number of successful switches since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn provider(name: &str, token_env: &str) -> ProviderConfig {
        ProviderConfig::new(name, format!("https://{name}.example"), token_env)
    }

    fn with_token(var: &str) {
        // Safety: test-only; every test uses its own variable name.
        unsafe {
            std::env::set_var(var, "token");
        }
    }

    #[test]
    fn test_default_is_active() {
        let sb = Switchboard::new(vec![provider("a", "X"), provider("b", "Y")], "b").unwrap();
        assert_eq!(sb.active_name(), "b");
        assert_eq!(sb.generation(), 0);
    }

    #[test]
    fn test_unknown_default_falls_back_to_first_by_name() {
        let sb = Switchboard::new(vec![provider("zeta", "X"), provider("alpha", "Y")], "nope")
            .unwrap();
        assert_eq!(sb.active_name(), "alpha");
    }

    #[test]
    fn test_empty_config_set_is_rejected() {
        assert!(Switchboard::new(vec![], "a").is_err());
    }

    #[test]
    fn test_switch_unknown_config() {
        let sb = Switchboard::new(vec![provider("a", "X")], "a").unwrap();
        let err = sb.switch("ghost").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownConfig { ref name } if name == "ghost"));
        assert_eq!(sb.active_name(), "a");
        assert_eq!(sb.generation(), 0);
    }

    #[test]
    fn test_switch_without_credential_is_rejected() {
        let sb = Switchboard::new(
            vec![
                provider("a", "IRONRELAY_SB_A"),
                provider("b", "IRONRELAY_SB_NEVER_SET"),
            ],
            "a",
        )
        .unwrap();
        let err = sb.switch("b").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig { .. }));
        assert_eq!(sb.active_name(), "a");
    }

    #[test]
    fn test_switch_replaces_active_and_bumps_generation() {
        with_token("IRONRELAY_SB_SWITCH_B");
        let sb = Switchboard::new(
            vec![provider("a", "X"), provider("b", "IRONRELAY_SB_SWITCH_B")],
            "a",
        )
        .unwrap();
        let held = sb.get_active();

        sb.switch("b").unwrap();
        assert_eq!(sb.active_name(), "b");
        assert_eq!(sb.generation(), 1);
        // A snapshot taken before the switch is unaffected.
        assert_eq!(held.name, "a");
    }

    #[test]
    fn test_list_marks_active() {
        let sb = Switchboard::new(vec![provider("b", "X"), provider("a", "Y")], "b").unwrap();
        let list = sb.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "a");
        assert!(!list[0].is_active);
        assert!(list[1].is_active);
    }

    #[test]
    fn test_concurrent_readers_see_pre_or_post_config() {
        with_token("IRONRELAY_SB_RACE_A");
        with_token("IRONRELAY_SB_RACE_B");
        let sb = Arc::new(
            Switchboard::new(
                vec![
                    provider("a", "IRONRELAY_SB_RACE_A"),
                    provider("b", "IRONRELAY_SB_RACE_B"),
                ],
                "a",
            )
            .unwrap(),
        );

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let sb = Arc::clone(&sb);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = sb.get_active();
                        assert!(snap.name == "a" || snap.name == "b");
                        assert_eq!(snap.base_url, format!("https://{}.example", snap.name));
                    }
                })
            })
            .collect();

        for i in 0..500 {
            sb.switch(if i % 2 == 0 { "b" } else { "a" }).unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(sb.generation(), 500);
    }
}
