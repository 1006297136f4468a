//! Correlation-id propagation.
//!
//! Every request gets a correlation id - echoed from `x-correlation-id` when
//! the client supplies one, generated otherwise. The id rides on the request
//! extensions for handlers and error bodies, is recorded on the request
//! tracing span so every log line carries it, and is set on the response.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Per-request context available to handlers via `Extension`.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub path: String,
}

pub async fn correlation_middleware(mut req: Request<Body>, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = RequestContext {
        correlation_id: correlation_id.clone(),
        path: req.uri().path().to_string(),
    };
    req.extensions_mut().insert(ctx);

    let span = tracing::info_span!(
        "http_request",
        method = %req.method(),
        path = %req.uri().path(),
        correlation_id = %correlation_id,
    );
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
