//! Debug HTTP endpoint: health and Prometheus metrics.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;

pub fn router() -> Router {
    Router::new()
        .route("/debug/healthz", get(healthz_handler))
        .route("/debug/metrics", get(metrics_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {e}"),
        )
            .into_response();
    }
    ([("content-type", encoder.format_type().to_owned())], buf).into_response()
}

/// Serves the debug endpoint until the token fires.
pub async fn serve(
    addr: String,
    token: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "debug endpoint listening");
    axum::serve(listener, router())
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    Ok(())
}
