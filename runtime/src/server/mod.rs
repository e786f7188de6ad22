//! HTTP and WebSocket surface of the coderoom runtime

pub mod docsync;
pub mod rooms;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use docsync::DocSyncEngine;
use rooms::RoomService;

/// Create the application router around already-constructed services.
pub fn create_app(
    rooms: Arc<RoomService>,
    doc_sync: Arc<dyn DocSyncEngine>,
    cors_origins: &[String],
) -> Router {
    Router::new()
        // Health check endpoint
        .route("/api/health", get(health_check))
        .merge(rooms::routes())
        .merge(docsync::routes())
        .layer(Extension(rooms))
        .layer(Extension(doc_sync))
        .layer(build_cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "ok": true }))
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().max_age(Duration::from_secs(600));

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        return cors
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    // Credentials forbid wildcards, so methods and headers mirror the preflight request.
    cors.allow_origin(parsed)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Starting coderoom server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
