//! HTTP proxy in front of the offline cache.
//!
//! Every path not under `/__offline/` is answered through
//! [`OfflineCache::fetch`]. The control endpoints are:
//!
//! - `GET /__offline/health`: lifecycle, version and cache sizes
//! - `POST /__offline/message`: a JSON [`ControlMessage`]; replies with the
//!   JSON [`ControlReply`], or `204` when the message has none

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use std::future::Future;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{ControlMessage, OfflineCache, ServedResponse};
use crate::source::{FetchRequest, Method};

/// Response header naming where the body came from.
pub const SERVED_FROM_HEADER: &str = "x-offline-served-from";

// Recomputed by the server for the body actually sent.
const SKIPPED_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Build an axum Router serving the cache.
pub fn router(cache: OfflineCache) -> Router {
    Router::new()
        .route("/__offline/health", get(health_handler))
        .route("/__offline/message", post(message_handler))
        .fallback(proxy_handler)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(cache)
}

/// Health check endpoint.
async fn health_handler(State(cache): State<OfflineCache>) -> impl IntoResponse {
    let status = cache.status().await;
    Json(serde_json::json!({
        "status": "ok",
        "lifecycle": status.lifecycle,
        "version": status.version,
        "caches": status.caches,
    }))
}

async fn message_handler(
    State(cache): State<OfflineCache>,
    Json(message): Json<ControlMessage>,
) -> Response {
    match cache.handle_message(message).await {
        Ok(Some(reply)) => Json(reply).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "Control message failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn proxy_handler(
    State(cache): State<OfflineCache>,
    method: HttpMethod,
    uri: Uri,
) -> Response {
    let method = match method {
        HttpMethod::GET => Method::Get,
        HttpMethod::HEAD => Method::Head,
        _ => return StatusCode::METHOD_NOT_ALLOWED.into_response(),
    };
    let target = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let request = FetchRequest {
        method,
        ..FetchRequest::get(target)
    };
    match cache.fetch(request).await {
        Ok(served) => into_response(served),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

fn into_response(served: ServedResponse) -> Response {
    let ServedResponse {
        response,
        served_from,
    } = served;
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;

    let headers = out.headers_mut();
    for (name, value) in &response.headers {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers.insert(
        SERVED_FROM_HEADER,
        HeaderValue::from_static(served_from.as_str()),
    );
    out
}

/// Serve the cache on the configured address until `shutdown` resolves,
/// then wait for background refreshes to finish.
pub async fn run(
    cache: OfflineCache,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let addr = format!("{}:{}", cache.config().host, cache.config().port);
    let app = router(cache.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Offline proxy listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    cache.settle().await;
    Ok(())
}
