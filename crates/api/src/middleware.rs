use std::time::Instant;

use axum::{
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Logs one line per request (method, path, status, latency) and echoes or
/// assigns an `x-request-id`.
pub async fn request_log(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let request_id = match req.headers().get(REQUEST_ID_HEADER) {
        Some(v) => v.clone(),
        None => {
            let generated = HeaderValue::from_str(&Uuid::now_v7().to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
            req.headers_mut().insert(REQUEST_ID_HEADER, generated.clone());
            generated
        }
    };

    let mut res = next.run(req).await;

    let status = res.status().as_u16();
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let rid = request_id.to_str().unwrap_or("-").to_string();
    if res.status().is_server_error() {
        warn!(request_id = %rid, %method, %path, status, latency_ms, "request failed");
    } else {
        info!(request_id = %rid, %method, %path, status, latency_ms, "request served");
    }

    res.headers_mut().insert(REQUEST_ID_HEADER, request_id);
    res
}
