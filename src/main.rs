//! WebSocket Relay Proxy
//!
//! Accepts WebSocket clients and gives each one its own connection to a
//! fixed upstream, relaying frames and closes between the two.
//!
//! # Architecture Overview
//!
//! ```text
//!                        ┌──────────────────────────────────────────────────┐
//!                        │                 WS RELAY PROXY                    │
//!                        │                                                   │
//!     Client ────────────┼─▶ net::listener ─▶ http::server ─▶ http::websocket│
//!                        │                                        │          │
//!                        │                                        ▼          │
//!                        │                            relay::RelayCoordinator│
//!                        │                                        │          │
//!                        │                                        ▼          │
//!     Client ◀───────────┼── ClientSocketHandle ◀── ConnectionPairing ──▶ upstream::WsConnector ──▶ Upstream
//!                        │                                                   │
//!                        │   config (toml + notify + arc-swap)  observability │
//!                        │   lifecycle (signals, shutdown)      resilience    │
//!                        └──────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use notify::RecommendedWatcher;

use ws_relay_proxy::config::validation::validate_config;
use ws_relay_proxy::config::watcher::ConfigWatcher;
use ws_relay_proxy::config::{read_config, ConfigError, ProxyConfig, TlsConfig};
use ws_relay_proxy::http::{ProxyCoordinator, ProxyServer};
use ws_relay_proxy::lifecycle::{signals, Shutdown};
use ws_relay_proxy::net::{listener, tls};
use ws_relay_proxy::observability::{logging, metrics};
use ws_relay_proxy::relay::UpstreamTarget;

#[derive(Parser, Debug, Clone)]
#[command(name = "ws-relay-proxy")]
#[command(about = "WebSocket reverse proxy with one upstream connection per client", long_about = None)]
struct Cli {
    /// TOML configuration file. Watched for upstream changes while running.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Upstream URL including scheme, e.g. ws://127.0.0.1:8009
    #[arg(long)]
    remote_host: Option<String>,

    /// Upstream port, used when the upstream URL has none
    #[arg(long)]
    remote_port: Option<u16>,

    /// PEM certificate for inbound TLS
    #[arg(long, requires = "key_file")]
    cert_file: Option<String>,

    /// PEM private key for inbound TLS
    #[arg(long, requires = "cert_file")]
    key_file: Option<String>,

    #[arg(long)]
    max_connections: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ws-relay-proxy: {}", e);
            return ExitCode::from(1);
        }
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ws-relay-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.url,
        max_connections = config.listener.max_connections,
        pending_frame_limit = config.relay.pending_frame_limit,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut server = match ProxyServer::new(config.clone()) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "Invalid upstream target");
            return ExitCode::from(1);
        }
    };

    if let Some(tls_config) = &config.listener.tls {
        match tls::load_tls_config(tls_config).await {
            Ok(rustls) => server = server.with_tls(rustls),
            Err(e) => {
                tracing::error!(error = %e, "Failed to load TLS certificate");
                return ExitCode::from(1);
            }
        }
    }

    let listener = match listener::bind(&config.listener).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(bind_address = %config.listener.bind_address, error = %e, "Listener failed");
            return ExitCode::from(1);
        }
    };

    let _watcher = cli
        .config
        .clone()
        .and_then(|path| watch_upstream(path, cli.clone(), server.coordinator()));

    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        signals::wait_for_signal().await;
        shutdown.trigger();
    });

    match server.run(listener, receiver).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server failed");
            ExitCode::from(1)
        }
    }
}

/// Load the configuration file (or defaults), apply CLI overrides, validate.
fn build_config(cli: &Cli) -> Result<ProxyConfig, ConfigError> {
    let mut config = match &cli.config {
        Some(path) => read_config(path)?,
        None => ProxyConfig::default(),
    };
    apply_overrides(cli, &mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

fn apply_overrides(cli: &Cli, config: &mut ProxyConfig) {
    if cli.host.is_some() || cli.port.is_some() {
        let (current_host, current_port) = config
            .listener
            .bind_address
            .rsplit_once(':')
            .map(|(host, port)| (host.to_string(), port.to_string()))
            .unwrap_or_else(|| ("127.0.0.1".to_string(), "8008".to_string()));

        let host = match &cli.host {
            Some(host) if host.contains(':') && !host.starts_with('[') => format!("[{}]", host),
            Some(host) => host.clone(),
            None => current_host,
        };
        let port = cli.port.map(|p| p.to_string()).unwrap_or(current_port);
        config.listener.bind_address = format!("{}:{}", host, port);
    }

    if let Some(max) = cli.max_connections {
        config.listener.max_connections = max;
    }
    if let (Some(cert_path), Some(key_path)) = (&cli.cert_file, &cli.key_file) {
        config.listener.tls = Some(TlsConfig {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        });
    }
    if let Some(url) = &cli.remote_host {
        config.upstream.url = url.clone();
    }
    if cli.remote_port.is_some() {
        config.upstream.port = cli.remote_port;
    }
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
}

/// Re-target new pairings whenever the config file changes.
fn watch_upstream(
    path: PathBuf,
    cli: Cli,
    coordinator: Arc<ProxyCoordinator>,
) -> Option<RecommendedWatcher> {
    let (watcher, mut updates) = ConfigWatcher::new(&path);
    let watcher = match watcher.run() {
        Ok(watcher) => watcher,
        Err(e) => {
            tracing::warn!(path = ?path, error = %e, "Config watcher unavailable, hot reload disabled");
            return None;
        }
    };

    tokio::spawn(async move {
        while let Some(mut reloaded) = updates.recv().await {
            apply_overrides(&cli, &mut reloaded);
            if let Err(errors) = validate_config(&reloaded) {
                tracing::warn!(
                    error = %ConfigError::Validation(errors),
                    "Reloaded config is invalid, keeping current"
                );
                continue;
            }
            match UpstreamTarget::from_config(&reloaded.upstream) {
                Ok(target) if *coordinator.current_target() != target => {
                    coordinator.retarget(target);
                }
                Ok(_) => tracing::debug!("Config reloaded, upstream unchanged"),
                Err(e) => tracing::warn!(error = %e, "Reloaded upstream is invalid, keeping current"),
            }
        }
    });

    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("ws-relay-proxy").chain(args.iter().copied()))
    }

    #[test]
    fn defaults_without_arguments() {
        let config = build_config(&cli(&[])).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8008");
        assert_eq!(config.upstream.url, "ws://127.0.0.1:8009");
    }

    #[test]
    fn overrides_listen_and_upstream() {
        let config = build_config(&cli(&[
            "--host",
            "0.0.0.0",
            "--port",
            "9100",
            "--remote-host",
            "wss://backend.internal",
            "--remote-port",
            "9443",
        ]))
        .unwrap();

        assert_eq!(config.listener.bind_address, "0.0.0.0:9100");
        assert_eq!(config.upstream.url, "wss://backend.internal");
        assert_eq!(config.upstream.port, Some(9443));
    }

    #[test]
    fn overrides_apply_before_file_is_validated() {
        let path = std::env::temp_dir().join(format!("ws-relay-main-{}.toml", std::process::id()));
        std::fs::write(&path, "[upstream]\nurl = \"http://retired-host\"\n").unwrap();
        let file = path.to_string_lossy().into_owned();

        assert!(build_config(&cli(&["--config", &file])).is_err());

        let config = build_config(&cli(&[
            "--config",
            &file,
            "--remote-host",
            "ws://replacement:9000",
        ]))
        .unwrap();
        assert_eq!(config.upstream.url, "ws://replacement:9000");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn port_only_keeps_configured_host() {
        let config = build_config(&cli(&["-p", "7000"])).unwrap();
        assert_eq!(config.listener.bind_address, "127.0.0.1:7000");

        let config = build_config(&cli(&["--host", "::1"])).unwrap();
        assert_eq!(config.listener.bind_address, "[::1]:8008");
    }

    #[test]
    fn invalid_override_fails_validation() {
        let err = build_config(&cli(&["--remote-host", "http://backend"])).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn tls_requires_both_files() {
        assert!(Cli::try_parse_from(["ws-relay-proxy", "--cert-file", "cert.pem"]).is_err());
        let config = build_config(&cli(&["--cert-file", "c.pem", "--key-file", "k.pem"])).unwrap();
        assert_eq!(config.listener.tls.unwrap().cert_path, "c.pem");
    }
}
