//! Request instrumentation and context injection.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;

use quay_core::Context;

/// The effective client address, honoring reverse-proxy headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr(pub IpAddr);

/// Returns the effective client address for this request, when known.
#[must_use]
pub fn remote_addr(ctx: &Context) -> Option<IpAddr> {
    ctx.get::<RemoteAddr>().map(|a| a.0)
}

/// Count and time every request.
pub(crate) async fn instrument(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_millis() as f64;
    metrics::histogram!("api_request_duration_millis").record(elapsed);
    metrics::counter!("api_requests_processed_total").increment(1);
    response
}

/// Install the server's base context (config, keys, database, cache, mail
/// queue, limits) into the request extensions.
pub(crate) async fn inject(State(base): State<Context>, mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(base);
    next.run(req).await
}

/// Resolve the effective client address from `X-Real-IP`, the first
/// `X-Forwarded-For` entry, or the socket address, and layer it into the
/// request context.
fn header_ip(req: &Request, name: &str) -> Option<IpAddr> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
}

pub(crate) async fn real_ip(mut req: Request, next: Next) -> Response {
    let ip = header_ip(&req, "X-Real-IP")
        .or_else(|| header_ip(&req, "X-Forwarded-For"))
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        });

    if let Some(ip) = ip {
        let ctx = req
            .extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_default();
        req.extensions_mut().insert(ctx.with(RemoteAddr(ip)));
    }
    next.run(req).await
}
