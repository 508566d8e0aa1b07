/**
 * TELEBRIDGE KERNEL - Point d'entrée du processus
 *
 * RÔLE : Charge la config, démarre le bridge (lien broker + broadcaster),
 * sert HTTP/WebSocket jusqu'à SIGINT/SIGTERM puis arrête tout dans l'ordre.
 */

use anyhow::{Context, Result};
use std::net::SocketAddr;
use telebridge_kernel::config::{load_config, DEFAULT_LOG_FILTER};
use telebridge_kernel::http::{build_router, AppState};
use telebridge_kernel::Bridge;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = load_config().await;
    cfg.validate().context("invalid configuration")?;
    let addr: SocketAddr = cfg.http.bind.parse().context("invalid http.bind")?;

    info!(broker = %format!("{}:{}", cfg.mqtt.host, cfg.mqtt.port), base = %cfg.topics.base, "starting bridge");
    let bridge = Bridge::start(cfg);

    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "cannot bind listener");
            bridge.shutdown().await;
            return Err(e).with_context(|| format!("failed to bind {addr}"));
        }
    };
    info!("listening on http://{addr}");

    let app = build_router(AppState { bridge: bridge.clone() });
    let signal_bridge = bridge.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_bridge.begin_shutdown();
        })
        .await;

    bridge.shutdown().await;
    served.context("http server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
