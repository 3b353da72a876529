//! SUMP3 host core: transport, device driver, topology discovery, sample
//! decoders, Signal/View model, and project archives, exposed over HTTP/JSON
//! (spec §6.5) the way the teacher's ILA server exposed its REST surface.
//!
//! ## Runtime configuration (see [`config::SumpConfig::from_env`])
//! - `SUMP_HOST` / `SUMP_PORT`: backdoor register-server address
//! - `SUMP_AES_KEY`: 64 hex chars, enables e2e transport encryption
//! - `SUMP_AUTH`: `1`/`true` to require authentication on non-loopback hosts
//! - `SUMP_HTTP_PORT`: control-surface HTTP port (default 8082)
//! - `RUST_LOG`: `tracing_subscriber::EnvFilter` syntax

mod config;
mod crypto;
mod decode;
mod driver;
mod error;
mod model;
mod pza;
mod server;
mod topology;
mod transport;
mod viewrom;

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server::AppState;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sump3_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cfg = config::SumpConfig::from_env();
    tracing::info!(host = %cfg.host, port = cfg.port, http_port = cfg.http_port, "sump3-core starting");

    let state = Arc::new(AppState::new(cfg.clone()));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = axum::Router::new()
        .nest("/api/sump", server::router(state))
        .layer(cors);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("listening on http://{addr}");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    tracing::info!("server shutdown complete");
}

/// Wait for Ctrl+C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("received SIGTERM, shutting down..."),
    }
}
