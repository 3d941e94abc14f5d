//! HTTP server for the scrape surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::sync::watch;

use super::Exporter;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_address: SocketAddr,
    pub metrics_path: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 8888)),
            metrics_path: "/metrics".to_string(),
        }
    }
}

/// Serve `/metrics` (path configurable) and `/healthz` until shutdown.
pub async fn serve(
    exporter: Arc<Exporter>,
    options: ServerOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route(&options.metrics_path, get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(exporter);

    let listener = tokio::net::TcpListener::bind(options.listen_address).await?;
    tracing::info!(
        address = %options.listen_address,
        path = %options.metrics_path,
        "scrape endpoint listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            // Either a shutdown signal or a dropped sender ends the server.
            let _ = shutdown.wait_for(|&stop| stop).await;
        })
        .await?;
    Ok(())
}

async fn metrics_handler(State(exporter): State<Arc<Exporter>>) -> Response {
    match exporter.render().await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to render scrape");
            (StatusCode::INTERNAL_SERVER_ERROR, "render failed").into_response()
        }
    }
}

async fn healthz_handler() -> &'static str {
    "ok"
}
