use crate::pipeline::orchestrator::SessionManager;
use crate::web::api::{close_session_handler, health_handler, list_sessions_handler, offer_handler};
use crate::web::ws::ws_output_handler;
use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn build_router(manager: Arc<SessionManager>) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/offer", post(offer_handler))
        .route("/ws", get(ws_output_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/:id", delete(close_session_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

pub async fn run_server(host: IpAddr, port: u16, manager: Arc<SessionManager>) -> Result<()> {
    let mut current_port = port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Must be non-blocking before registering with Tokio
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    };

    let app = build_router(manager.clone());

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Vision relay server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app)
        .with_graceful_shutdown(shutdown_signal(manager))
        .await?;

    Ok(())
}

/// Resolves on ctrl-c once every session has been torn down, so the server
/// stops only after all pipeline workers are gone.
async fn shutdown_signal(manager: Arc<SessionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    manager.shutdown_all().await;
}
