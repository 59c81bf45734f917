//! HTTP ingress for provider webhooks

use anyhow::{Context, Result};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

use super::pipeline::IngestPipeline;

const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

fn with_pipeline(
    pipeline: Arc<IngestPipeline>,
) -> impl Filter<Extract = (Arc<IngestPipeline>,), Error = Infallible> + Clone {
    warp::any().map(move || pipeline.clone())
}

/// `POST /webhook` takes a JSON array of transaction descriptions,
/// `GET /health` answers 200
pub fn routes(
    pipeline: Arc<IngestPipeline>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::with_status(warp::reply::json(&serde_json::json!({ "status": "ok" })), StatusCode::OK));

    let webhook = warp::path("webhook")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_pipeline(pipeline))
        .and_then(handle_webhook);

    health.or(webhook)
}

async fn handle_webhook(
    records: Vec<Value>,
    pipeline: Arc<IngestPipeline>,
) -> Result<warp::reply::WithStatus<warp::reply::Json>, Infallible> {
    let received = records.len();
    match pipeline.ingest_records(records).await {
        Ok(forwarded) => {
            info!("📬 Webhook: {} records, {} transfers forwarded", received, forwarded);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "received": received, "forwarded": forwarded })),
                StatusCode::OK,
            ))
        }
        Err(e) => {
            error!("Webhook processing failed: {:#}", e);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({ "error": "Internal Server Error" })),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

/// Serves the webhook until shutdown is signalled
pub async fn serve(port: u16, pipeline: Arc<IngestPipeline>, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let (bound, server) = warp::serve(routes(pipeline))
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown.recv().await;
        })
        .with_context(|| format!("Failed to bind webhook server on {}", addr))?;

    info!("🌐 Webhook server listening on {}", bound);
    server.await;
    info!("🛑 Webhook server stopped");
    Ok(())
}
