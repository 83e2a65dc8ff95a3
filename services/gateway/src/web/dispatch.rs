//! Per-request host dispatch.
//!
//! Order of checks, each failing closed with a generic response:
//! 1. host from the request (port stripped, lowercase)
//! 2. client address from the connection (500 if missing)
//! 3. firewall: whitelisted, or asking for the portal host (407)
//! 4. path and host allow-lists (400)
//! 5. route lookup on (local port, host) with matching TLS mode (400)
//! 6. route handler, then hardening headers and per-route headers

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Redirect, Response},
};
use tracing::{debug, error, info};

use super::{portal, reverse, static_files, ApiError, ConnectionMeta, WebState};
use crate::firewall::{validate_input, InputKind};
use crate::proxy::{FuncRoute, RouteDescriptor, RouteKind};

const HSTS: &str = "max-age=63072000; includeSubDomains; preload";
const CSP: &str = "default-src 'self'; frame-ancestors 'none'";
const PERMISSIONS_POLICY: &str = "geolocation=(), camera=(), microphone=()";

/// Fallback handler for every web request.
pub async fn dispatch(State(state): State<WebState>, req: Request) -> Response {
    let host = request_host(&req);

    let Some(meta) = req.extensions().get::<ConnectionMeta>().copied() else {
        error!(host = %host, "Request without connection metadata");
        return ApiError::internal().into_response();
    };
    let client_ip = meta.peer.ip().to_canonical();

    let is_portal = state
        .portal
        .as_ref()
        .is_some_and(|portal| portal.host == host);
    if state.firewall.enforces_whitelist() && !is_portal && !state.registry.check_only(client_ip) {
        info!(client_ip = %client_ip, host = %host, "Access denied");
        return ApiError::proxy_auth_required().into_response();
    }

    if !validate_input(req.uri().path(), InputKind::Path) {
        info!(client_ip = %client_ip, "Invalid request path");
        return ApiError::unknown_domain().into_response();
    }
    if !validate_input(&host, InputKind::Host) {
        info!(client_ip = %client_ip, "Invalid request host");
        return ApiError::unknown_domain().into_response();
    }

    let routes = Arc::clone(&state.routes);
    let Some(route) = routes
        .web_route(meta.local.port(), &host)
        .filter(|route| route.tls == meta.tls)
    else {
        info!(
            client_ip = %client_ip,
            host = %host,
            port = meta.local.port(),
            "Requested host is not a configured route"
        );
        return ApiError::unknown_domain().into_response();
    };

    debug!(client_ip = %client_ip, host = %host, kind = ?route.kind, target = %route.target, "Routing request");

    let mut response = match route.kind {
        RouteKind::Proxy => reverse::forward(&state, route, req, client_ip).await,
        RouteKind::Static => static_files::serve_route(route, req).await,
        RouteKind::Redirect => redirect(route, &req),
        RouteKind::Func(FuncRoute::Portal) => portal::handle(&state, req, client_ip).await,
    };

    if !route.flags.strip_headers {
        apply_hardening_headers(response.headers_mut(), meta.tls);
    }
    for (name, value) in &route.headers {
        response.headers_mut().insert(name.clone(), value.clone());
    }
    response
}

fn redirect(route: &RouteDescriptor, req: &Request) -> Response {
    let Some(base) = reverse::normalize_target(&route.target, true) else {
        error!(target = %route.target, "Invalid redirect target");
        return ApiError::bad_gateway().into_response();
    };
    let location = reverse::upstream_url(&base, req.uri(), route.flags.strip_prefix.as_deref());
    Redirect::permanent(location.as_str()).into_response()
}

fn apply_hardening_headers(headers: &mut HeaderMap, tls: bool) {
    if tls {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS),
        );
    }
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(CSP),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("no-referrer"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static(PERMISSIONS_POLICY),
    );
}

/// Host the client asked for, without port, lowercase.
pub(crate) fn request_host(req: &Request) -> String {
    let raw = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    strip_port(raw.trim()).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(bracketed) = host.strip_prefix('[') {
        return bracketed.split(']').next().unwrap_or(bracketed);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
