//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router that upgrades every path to a relayed session
//! - Own the relay coordinator and the connection tracker
//! - Serve plain TCP or TLS on an already bound listener
//! - On shutdown: stop accepting, then close every pairing with 1001 and drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::any, Router};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::{ProxyConfig, RelayConfig};
use crate::http::websocket::{upgrade_handler, ClientSocketHandle};
use crate::net::connection::ConnectionTracker;
use crate::relay::event::CLOSE_GOING_AWAY;
use crate::relay::{RelayCoordinator, RelayError, UpstreamTarget};
use crate::upstream::{ConnectPolicy, WsConnector};

/// The coordinator type the server runs.
pub type ProxyCoordinator = RelayCoordinator<ClientSocketHandle, WsConnector>;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ProxyCoordinator>,
    pub tracker: ConnectionTracker,
    /// Write queue and close deadline for client sockets.
    pub relay: RelayConfig,
}

/// WebSocket server for the reverse proxy.
pub struct ProxyServer {
    router: Router,
    config: ProxyConfig,
    state: AppState,
    tls: Option<RustlsConfig>,
}

impl ProxyServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, RelayError> {
        let target = UpstreamTarget::from_config(&config.upstream)?;
        let connector = WsConnector::new(ConnectPolicy::from_config(
            &config.upstream,
            &config.relay,
        ));
        let coordinator = Arc::new(RelayCoordinator::new(
            connector,
            target,
            config.listener.max_connections,
            &config.relay,
        ));

        let state = AppState {
            coordinator,
            tracker: ConnectionTracker::new(),
            relay: config.relay.clone(),
        };

        let router = Self::build_router(state.clone());
        Ok(Self {
            router,
            config,
            state,
            tls: None,
        })
    }

    /// Terminate TLS on the listener with the given certificate.
    pub fn with_tls(mut self, tls: RustlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", any(upgrade_handler))
            .route("/{*path}", any(upgrade_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires, then close and drain every pairing.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        let coordinator = self.coordinator();
        let grace = Duration::from_secs(self.config.relay.shutdown_grace_secs);

        tracing::info!(
            address = %addr,
            upstream = %coordinator.current_target(),
            tls = self.tls.is_some(),
            max_connections = self.config.listener.max_connections,
            "WebSocket proxy listening"
        );

        let on_shutdown = async move {
            let _ = shutdown.recv().await;
            tracing::info!("Shutdown signal received");
        };

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        match self.tls {
            None => {
                axum::serve(listener, app)
                    .with_graceful_shutdown(on_shutdown)
                    .await?;
                coordinator.shutdown_all(CLOSE_GOING_AWAY, "proxy shutting down");
            }
            Some(tls) => {
                let handle = axum_server::Handle::new();
                let trigger = handle.clone();
                let coordinator = Arc::clone(&coordinator);
                tokio::spawn(async move {
                    on_shutdown.await;
                    trigger.graceful_shutdown(Some(grace));
                    coordinator.shutdown_all(CLOSE_GOING_AWAY, "proxy shutting down");
                });
                axum_server::from_tcp_rustls(listener.into_std()?, tls)
                    .handle(handle)
                    .serve(app)
                    .await?;
            }
        }

        if !self.state.tracker.drain(grace).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Grace period elapsed with sessions still open"
            );
        }

        tracing::info!("WebSocket proxy stopped");
        Ok(())
    }

    pub fn coordinator(&self) -> Arc<ProxyCoordinator> {
        Arc::clone(&self.state.coordinator)
    }
}
