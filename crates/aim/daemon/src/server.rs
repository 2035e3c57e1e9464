//! Server wiring and lifecycle.

use crate::api::rest::{create_router, AppState};
use crate::config::{DaemonConfig, StorageConfig};
use crate::error::{DaemonError, DaemonResult};
use aim_storage::{ControlPlaneStore, MemoryStore, PgStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

/// The AIM control-plane server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Build storage and services from configuration.
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store: Arc<dyn ControlPlaneStore> = match &config.storage {
            StorageConfig::Memory => {
                tracing::warn!("using in-memory storage; data is lost on restart");
                Arc::new(MemoryStore::new())
            }
            StorageConfig::Postgres {
                url,
                max_connections,
                connect_timeout_secs,
            } => Arc::new(
                PgStore::connect_with_options(url, *max_connections, *connect_timeout_secs)
                    .await?,
            ),
        };
        Ok(Self {
            state: AppState::build(store, config),
        })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until SIGINT/SIGTERM, then drain gracefully.
    pub async fn run(self) -> DaemonResult<()> {
        crate::api::rest::handlers::mark_started();
        let addr = self.state.config.server.listen_addr;
        let timeout = Duration::from_secs(self.state.config.server.request_timeout_secs);
        let router = create_router(self.state).layer(
            tower_http::timeout::TimeoutLayer::new(timeout),
        );

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(DaemonError::Io)?;
        tracing::info!(%addr, "aimd listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()))
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install ctrl-c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining");
}
