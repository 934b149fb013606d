//! Plugin discovery, persistence and lifecycle orchestration.
//!
//! ```text
//!  search paths ──discover()──▶ Discovered ──(disabled?)──▶ Disabled
//!                                   │
//!                                 load()      entry point → ChannelFactory
//!                                   ▼
//!                                Loaded
//!                                   │
//!                               register()    inbound path → RouteTable
//!                                   ▼
//!                              Registered
//!                                   │
//!                                start()
//!                                   ▼
//!                                Started ──stop()──▶ Stopped
//! ```
//!
//! Any step may end in `Failed`; the failure is recorded on that plugin only.

mod config_store;
mod discovery;
mod manifest;
mod plugin_manager;
mod routes;

pub use config_store::{PluginConfigFile, PluginConfigStore, PluginSettings};
pub use discovery::{DiscoveredPlugin, PluginDiscovery, PluginSource, SearchPath};
pub use manifest::{
    CHANNEL_CONTRACT_VERSION, MANIFEST_FILE, PluginManifest, PluginType, is_kebab_case,
};
pub use plugin_manager::{
    FactoryRegistry, HealthReport, LifecycleStage, OrchestrationReport, PluginInfo,
    PluginManager, PluginSnapshot, PluginState, PluginSummary,
};
pub use routes::RouteTable;
