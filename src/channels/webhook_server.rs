//! HTTP host for the relay API and channel inbound routes.
//!
//! The router is assembled by [`crate::api`]; channel routes are resolved per
//! request through the route table, so the server never needs rebuilding
//! when plugins come and go.

use std::net::SocketAddr;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ChannelError;

pub struct RelayServerConfig {
    /// Address to bind; port 0 picks a free port.
    pub addr: SocketAddr,
}

/// Single axum server with graceful shutdown.
pub struct RelayServer {
    config: RelayServerConfig,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        Self {
            config,
            local_addr: None,
            shutdown_tx: None,
            handle: None,
        }
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and serve `app` in a background task.
    pub async fn start(&mut self, app: Router) -> Result<SocketAddr, ChannelError> {
        let startup_failed = |reason: String| ChannelError::StartupFailed {
            name: "relay_server".to_string(),
            reason,
        };
        let listener = tokio::net::TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| startup_failed(format!("Failed to bind to {}: {}", self.config.addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| startup_failed(e.to_string()))?;

        tracing::info!(addr = %addr, "Relay server listening");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Relay server shutting down");
                })
                .await
            {
                tracing::error!(error = %e, "Relay server error");
            }
        });

        self.local_addr = Some(addr);
        self.shutdown_tx = Some(shutdown_tx);
        self.handle = Some(handle);
        Ok(addr)
    }

    /// Resolve when the server task ends on its own.
    pub async fn wait(&mut self) {
        if let Some(handle) = self.handle.as_mut() {
            let _ = handle.await;
            self.handle = None;
        }
    }

    /// Signal graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
