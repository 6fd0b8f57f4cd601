//! Request logging middleware.
//!
//! Logs every admin API request with method, path, the `trader_id` it was
//! scoped to (spec §6's `?trader_id=` convention), status code, and latency.

use axum::{body::Body, http::Request, http::Uri, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

fn trader_id_from_query(uri: &Uri) -> String {
    uri.query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("trader_id=")))
        .unwrap_or("-")
        .to_string()
}

/// Logs method, path, scoped trader id, status code, and latency for every
/// request except health checks.
pub async fn request_logging_simple(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path().to_string();

    // Skip logging for health checks
    if path == "/health" {
        return next.run(request).await;
    }

    let trader_id = trader_id_from_query(&uri);
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            trader_id = %trader_id,
            status = status,
            latency_ms = latency.as_millis(),
            "Request failed (5xx)"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            trader_id = %trader_id,
            status = status,
            latency_ms = latency.as_millis(),
            "Request completed"
        );
    }

    response
}
