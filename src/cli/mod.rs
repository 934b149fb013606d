//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running the relay (`serve`, the default)
//! - Plugin management (`plugins list`, `plugins info`, `plugins enable`,
//!   `plugins disable`, `plugins install`, `plugins health`)
//! - Provider listing (`providers list`)

mod plugins;
mod providers;
mod serve;

pub use plugins::{PluginsCommand, run_plugins_command};
pub use providers::{ProvidersCommand, run_providers_command};
pub use serve::run_serve;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::channels::{WEBHOOK_ENTRY_POINT, WebhookFactory};
use crate::config::Config;
use crate::extensions::{FactoryRegistry, PluginConfigStore, PluginDiscovery, PluginManager};
use crate::switchboard::{ProviderConfig, Switchboard, builtin_providers, load_providers_file};

#[derive(Parser, Debug)]
#[command(name = "ironrelay")]
#[command(about = "Session and channel-plugin relay for agent runtimes")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server (default if no subcommand given)
    Serve,

    /// Manage channel plugins
    #[command(subcommand)]
    Plugins(PluginsCommand),

    /// Inspect provider configurations
    #[command(subcommand)]
    Providers(ProvidersCommand),
}

/// Channel factories compiled into this binary.
pub fn builtin_factories() -> FactoryRegistry {
    FactoryRegistry::new().with(WEBHOOK_ENTRY_POINT, Arc::new(WebhookFactory))
}

/// Provider configs from the providers file, or the built-in set.
pub fn load_providers(config: &Config) -> anyhow::Result<Vec<ProviderConfig>> {
    match &config.providers_file {
        Some(path) => load_providers_file(path)
            .with_context(|| format!("loading providers from {}", path.display())),
        None => Ok(builtin_providers()),
    }
}

pub fn build_switchboard(config: &Config) -> anyhow::Result<Switchboard> {
    let providers = load_providers(config)?;
    Ok(Switchboard::new(providers, &config.default_provider)?)
}

/// Plugin manager over the configured search paths. Nothing is started.
pub fn build_plugin_manager(config: &Config) -> anyhow::Result<PluginManager> {
    let paths = &config.plugins;
    let store = PluginConfigStore::load(&paths.config_file)
        .with_context(|| format!("loading plugin config {}", paths.config_file.display()))?;
    Ok(PluginManager::new(
        PluginDiscovery::from_locations(&paths.bundled, &paths.installed, &paths.external),
        Arc::new(store),
        builtin_factories(),
        paths.installed.clone(),
    ))
}
