//! HTTP and WebSocket front end for the agent gateway.

mod http;
mod ws;

use std::future::Future;

use agent_gateway_core::Gateway;
use anyhow::Context;
use axum::Router;
use axum::routing::get;
use axum::routing::post;
use tokio::net::TcpListener;
use tracing::info;

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/ws-token", post(http::issue_token))
        .route("/ws", get(ws::upgrade))
        .route("/healthz", get(http::healthz))
        .with_state(gateway)
}

/// Serves the gateway on `listener` until `shutdown` resolves, then closes
/// every socket and stops every agent process before returning.
pub async fn serve<F>(listener: TcpListener, gateway: Gateway, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let sweeper = gateway.spawn_token_sweeper();
    let app = router(gateway.clone());
    let graceful = {
        let gateway = gateway.clone();
        async move {
            shutdown.await;
            info!("shutting down agent gateway");
            gateway.shutdown().await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
        .context("http serve")?;

    gateway.shutdown().await;
    let _ = sweeper.await;
    Ok(())
}

/// Resolves on Ctrl-C, or on SIGTERM where available.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
