//! `ironrelay serve`: wire every component and run until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;

use super::{build_plugin_manager, build_switchboard};
use crate::agent::AgentService;
use crate::api::{self, AppState};
use crate::channels::{ChannelDispatcher, ChannelSessionMapper, RelayServer, RelayServerConfig};
use crate::config::Config;
use crate::hot_reload::{ConfigWatcher, spawn_reloader};
use crate::runtime::ProcessRuntime;
use crate::session::SessionRegistry;
use crate::stream::TranslatorOptions;

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

pub async fn run_serve(config: Config) -> anyhow::Result<()> {
    let switchboard = Arc::new(build_switchboard(&config)?);
    let registry = Arc::new(SessionRegistry::new());
    let runtime = Arc::new(
        ProcessRuntime::new(config.runtime.binary.clone()).with_cwd(config.runtime.cwd.clone()),
    );
    let agent = Arc::new(AgentService::new(
        switchboard,
        Arc::clone(&registry),
        runtime,
        TranslatorOptions {
            heartbeat: config.heartbeat,
            ..TranslatorOptions::default()
        },
    ));

    let mapper = Arc::new(ChannelSessionMapper::new(
        Arc::clone(&registry),
        config.session_ttl,
    ));
    let sweeper = Arc::clone(&mapper).spawn_sweeper(config.sweep_interval);

    let plugins = Arc::new(build_plugin_manager(&config)?);
    plugins.set_bridge(Arc::new(ChannelDispatcher::new(
        Arc::clone(&agent),
        Arc::clone(&mapper),
    )));
    let report = plugins.orchestrate().await;
    tracing::info!(
        started = report.started.len(),
        disabled = report.disabled.len(),
        failed = report.failed.len(),
        "Plugins orchestrated"
    );

    let mut watcher = ConfigWatcher::new();
    watcher
        .watch_file(config.plugins.config_file.clone())
        .context("watching plugin config")?;
    for dir in [&config.plugins.bundled, &config.plugins.installed]
        .into_iter()
        .chain(&config.plugins.external)
    {
        if let Err(e) = watcher.watch_dir(dir.clone()) {
            tracing::warn!(path = %dir.display(), error = %e, "Failed to watch plugin directory");
        }
    }
    let reloader = spawn_reloader(Arc::clone(&plugins), watcher.subscribe(), RELOAD_DEBOUNCE);

    let mut server = RelayServer::new(RelayServerConfig { addr: config.bind });
    server
        .start(api::router(AppState {
            agent,
            plugins: Arc::clone(&plugins),
            mapper,
        }))
        .await?;

    tokio::select! {
        _ = signal::ctrl_c() => tracing::info!("Shutdown requested"),
        _ = server.wait() => tracing::warn!("Relay server exited"),
    }

    drop(watcher);
    reloader.abort();
    sweeper.abort();
    server.shutdown().await;
    plugins.stop_all().await;
    tracing::info!("Relay stopped");
    Ok(())
}
