//! Plugin management CLI commands.
//!
//! These run against the on-disk state only. Enable/disable edits are
//! picked up by a running relay through hot reload.

use std::path::PathBuf;

use anyhow::Context;
use clap::Subcommand;

use super::{build_plugin_manager, builtin_factories};
use crate::config::Config;
use crate::extensions::{
    CHANNEL_CONTRACT_VERSION, DiscoveredPlugin, FactoryRegistry, PluginConfigStore,
    PluginDiscovery, PluginType,
};

/// Plugin management commands.
#[derive(Subcommand, Debug)]
pub enum PluginsCommand {
    /// List discovered plugins.
    List,
    /// Show plugin details.
    Info {
        /// Plugin id.
        id: String,
    },
    /// Enable a plugin.
    Enable {
        /// Plugin id.
        id: String,
    },
    /// Disable a plugin.
    Disable {
        /// Plugin id.
        id: String,
    },
    /// Install a plugin from a local directory.
    Install {
        /// Directory containing plugin.json.
        path: PathBuf,
    },
    /// Check that a plugin can be loaded by this binary.
    Health {
        /// Plugin id.
        id: String,
    },
}

/// Run a plugins command.
pub async fn run_plugins_command(cmd: &PluginsCommand, config: &Config) -> anyhow::Result<()> {
    match cmd {
        PluginsCommand::List => {
            let store = PluginConfigStore::load(&config.plugins.config_file)?;
            let plugins = discovery(config).discover();
            if plugins.is_empty() {
                println!("No plugins found.");
                return Ok(());
            }
            println!("{:<24} {:<10} {:<10} {:<9} NAME", "ID", "VERSION", "SOURCE", "ENABLED");
            for (id, plugin) in &plugins {
                println!(
                    "{:<24} {:<10} {:<10} {:<9} {}",
                    id,
                    plugin.manifest.version,
                    plugin.source.to_string(),
                    if store.is_enabled(id) { "yes" } else { "no" },
                    plugin.manifest.name
                );
            }
        }
        PluginsCommand::Info { id } => {
            let store = PluginConfigStore::load(&config.plugins.config_file)?;
            let plugin = find(config, id)?;
            let manifest = &plugin.manifest;
            println!("Plugin: {} ({})", manifest.name, manifest.id);
            println!("  Version:     {}", manifest.version);
            println!("  Type:        {}", manifest.plugin_type);
            println!("  Entry point: {}", manifest.entry_point);
            println!("  Contract:    {}", manifest.contract);
            println!("  Source:      {}", plugin.source);
            println!("  Path:        {}", plugin.path.display());
            println!("  Enabled:     {}", store.is_enabled(id));
            if !manifest.description.is_empty() {
                println!("  Description: {}", manifest.description);
            }
            let settings = store.settings(id);
            if !settings.is_empty() {
                println!(
                    "  Settings:    {}",
                    serde_json::to_string_pretty(&settings)?
                );
            }
        }
        PluginsCommand::Enable { id } => {
            let manager = build_plugin_manager(config)?;
            if manager.enable(id)? {
                println!("Enabled plugin: {id}");
            } else {
                println!("Plugin already enabled: {id}");
            }
        }
        PluginsCommand::Disable { id } => {
            let manager = build_plugin_manager(config)?;
            if manager.disable(id)? {
                println!("Disabled plugin: {id}");
            } else {
                println!("Plugin already disabled: {id}");
            }
        }
        PluginsCommand::Install { path } => {
            let manager = build_plugin_manager(config)?;
            let installed = manager
                .install(path)
                .with_context(|| format!("installing plugin from {}", path.display()))?;
            println!(
                "Installed plugin {} {} to {}",
                installed.manifest.id,
                installed.manifest.version,
                installed.path.display()
            );
            println!("Run `ironrelay plugins enable {}` to activate it.", installed.manifest.id);
        }
        PluginsCommand::Health { id } => {
            let store = PluginConfigStore::load(&config.plugins.config_file)?;
            let plugin = find(config, id)?;
            let problems = offline_check(&plugin, &builtin_factories(), store.is_enabled(id));
            if problems.is_empty() {
                println!("Plugin {id}: healthy");
            } else {
                println!("Plugin {id}: unhealthy");
                for problem in &problems {
                    println!("  - {problem}");
                }
                anyhow::bail!("plugin {id} failed {} check(s)", problems.len());
            }
        }
    }
    Ok(())
}

fn discovery(config: &Config) -> PluginDiscovery {
    PluginDiscovery::from_locations(
        &config.plugins.bundled,
        &config.plugins.installed,
        &config.plugins.external,
    )
}

fn find(config: &Config, id: &str) -> anyhow::Result<DiscoveredPlugin> {
    discovery(config)
        .discover()
        .remove(id)
        .with_context(|| format!("plugin not found: {id}"))
}

/// Checks that do not require a running relay. Manifest validity is already
/// guaranteed by discovery.
fn offline_check(
    plugin: &DiscoveredPlugin,
    factories: &FactoryRegistry,
    enabled: bool,
) -> Vec<String> {
    let manifest = &plugin.manifest;
    let mut problems = Vec::new();
    if manifest.plugin_type != PluginType::Channel {
        problems.push(format!("plugin type '{}' is not loadable", manifest.plugin_type));
    }
    if manifest.contract != CHANNEL_CONTRACT_VERSION {
        problems.push(format!(
            "manifest targets contract {}, host implements {}",
            manifest.contract, CHANNEL_CONTRACT_VERSION
        ));
    }
    if !factories.contains(&manifest.entry_point) {
        problems.push(format!("unknown entry point '{}'", manifest.entry_point));
    }
    if !enabled {
        problems.push("plugin is disabled".to_string());
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extensions::{PluginManifest, PluginSource};

    fn plugin(entry_point: &str, contract: &str) -> DiscoveredPlugin {
        DiscoveredPlugin {
            manifest: PluginManifest {
                id: "hook-in".to_string(),
                name: "Hook In".to_string(),
                version: "0.1.0".to_string(),
                description: String::new(),
                plugin_type: PluginType::Channel,
                entry_point: entry_point.to_string(),
                contract: contract.to_string(),
                config_schema: None,
            },
            path: PathBuf::from("/plugins/hook-in"),
            source: PluginSource::Bundled,
        }
    }

    #[test]
    fn test_offline_check_passes() {
        let problems = offline_check(
            &plugin("webhook", CHANNEL_CONTRACT_VERSION),
            &builtin_factories(),
            true,
        );
        assert!(problems.is_empty(), "{problems:?}");
    }

    #[test]
    fn test_offline_check_reports_every_problem() {
        let problems = offline_check(&plugin("telegram", "9"), &builtin_factories(), false);
        assert_eq!(problems.len(), 3);
        assert!(problems[0].contains("contract 9"));
        assert!(problems[1].contains("telegram"));
        assert_eq!(problems[2], "plugin is disabled");
    }

    #[tokio::test]
    async fn test_enable_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let bundled = dir.path().join("plugins/bundled/webhook");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(
            bundled.join("plugin.json"),
            r#"{"id":"webhook","name":"Webhook","type":"channel","entry_point":"webhook"}"#,
        )
        .unwrap();
        let config = Config::from_lookup(|key| match key {
            "IRONRELAY_HOME" => Some(dir.path().display().to_string()),
            _ => None,
        })
        .unwrap();

        run_plugins_command(&PluginsCommand::Enable { id: "webhook".to_string() }, &config)
            .await
            .unwrap();
        let store = PluginConfigStore::load(&config.plugins.config_file).unwrap();
        assert!(store.is_enabled("webhook"));

        run_plugins_command(&PluginsCommand::Health { id: "webhook".to_string() }, &config)
            .await
            .unwrap();
        assert!(
            run_plugins_command(&PluginsCommand::Info { id: "missing".to_string() }, &config)
                .await
                .is_err()
        );
    }
}
