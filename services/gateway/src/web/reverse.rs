//! Reverse proxy to upstream URLs.
//!
//! Request and response bodies are streamed in both directions. Requests
//! carrying `Connection: upgrade` keep their `Upgrade` header; when the
//! upstream answers `101 Switching Protocols` both upgraded connections are
//! spliced until either side closes or the gateway shuts down.

use std::net::IpAddr;

use axum::{
    body::Body,
    extract::Request,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use hyper::body::Body as _;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::{ApiError, WebState};
use crate::error::GatewayError;
use crate::proxy::{splice, RouteDescriptor, DEFAULT_CONNECT_TIMEOUT};

/// Headers that must not be forwarded by a proxy.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_ORIGIN_HOST: HeaderName = HeaderName::from_static("x-origin-host");

/// Upstream HTTP clients.
///
/// Redirects are passed back to the client untouched. Routes flagged
/// `allow_insecure` use a client that skips certificate verification.
#[derive(Debug, Clone)]
pub struct Upstream {
    verified: reqwest::Client,
    insecure: reqwest::Client,
}

impl Upstream {
    pub fn new() -> Result<Self, GatewayError> {
        Ok(Self {
            verified: build_client(false)?,
            insecure: build_client(true)?,
        })
    }

    fn client(&self, allow_insecure: bool) -> &reqwest::Client {
        if allow_insecure {
            &self.insecure
        } else {
            &self.verified
        }
    }
}

fn build_client(accept_invalid_certs: bool) -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
        .map_err(|e| GatewayError::Config(format!("failed to build upstream client: {}", e)))
}

/// Parse a route target into an absolute URL.
///
/// Targets without a scheme get `https://` when `prefer_https` is set and
/// `http://` otherwise. Returns `None` for empty targets and URLs without a
/// host.
pub(crate) fn normalize_target(target: &str, prefer_https: bool) -> Option<Url> {
    let target = target.trim();
    if target.is_empty() {
        return None;
    }
    let url = if target.contains("://") {
        Url::parse(target).ok()?
    } else {
        let scheme = if prefer_https { "https" } else { "http" };
        Url::parse(&format!("{}://{}", scheme, target)).ok()?
    };
    url.host_str()?;
    Some(url)
}

/// Join the request path and query onto `base`.
pub(crate) fn upstream_url(base: &Url, uri: &Uri, strip_prefix: Option<&str>) -> Url {
    let mut path = uri.path();
    if let Some(prefix) = strip_prefix.filter(|prefix| !prefix.is_empty()) {
        path = path.strip_prefix(prefix).unwrap_or(path);
    }

    let mut url = base.clone();
    url.set_path(&single_joining_slash(base.path(), path));

    let query = match (
        base.query().filter(|q| !q.is_empty()),
        uri.query().filter(|q| !q.is_empty()),
    ) {
        (Some(a), Some(b)) => Some(format!("{}&{}", a, b)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    };
    url.set_query(query.as_deref());
    url
}

fn single_joining_slash(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{}/{}", a, b),
        _ => format!("{}{}", a, b),
    }
}

/// Copy `headers` without hop-by-hop headers, including any named in
/// `Connection`.
fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name_str = name.as_str();
        if HOP_BY_HOP_HEADERS.contains(&name_str) || listed.iter().any(|l| l == name_str) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Whether `headers` ask for a protocol upgrade.
fn is_upgrade(headers: &HeaderMap) -> bool {
    headers.contains_key(header::UPGRADE)
        && headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
}

/// Forward `req` to the route's upstream and stream the response back.
pub(crate) async fn forward(
    state: &WebState,
    route: &RouteDescriptor,
    mut req: Request,
    client_ip: IpAddr,
) -> Response {
    let Some(base) = normalize_target(&route.target, route.flags.allow_insecure_upstream) else {
        warn!(target = %route.target, "Proxy route has no usable upstream");
        return ApiError::bad_gateway().into_response();
    };

    let client_upgrade = is_upgrade(req.headers()).then(|| hyper::upgrade::on(&mut req));
    let (parts, body) = req.into_parts();
    let url = upstream_url(&base, &parts.uri, route.flags.strip_prefix.as_deref());

    let mut headers = end_to_end_headers(&parts.headers);
    if client_upgrade.is_some() {
        if let Some(protocol) = parts.headers.get(header::UPGRADE) {
            headers.insert(header::UPGRADE, protocol.clone());
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        }
    }
    headers.remove(header::HOST);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }
    if let Some(origin) = base.host_str() {
        let origin = match base.port() {
            Some(port) => format!("{}:{}", origin, port),
            None => origin.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(X_ORIGIN_HOST, value);
        }
    }
    let forwarded_for = match parts
        .headers
        .get(&X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    debug!(method = %parts.method, upstream = %url, "Forwarding request");

    let mut request = state
        .upstream
        .client(route.flags.allow_insecure_upstream)
        .request(parts.method, url.clone())
        .headers(headers);
    if !body.is_end_stream() {
        request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream_response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(upstream = %url, error = %e, "Upstream request failed");
            return ApiError::bad_gateway().into_response();
        }
    };

    let status = upstream_response.status();
    let mut headers = end_to_end_headers(upstream_response.headers());

    if status == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            warn!(upstream = %url, "Upstream switched protocols without an upgrade request");
            return ApiError::bad_gateway().into_response();
        };
        if let Some(protocol) = upstream_response.headers().get(header::UPGRADE) {
            headers.insert(header::UPGRADE, protocol.clone());
        }
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));

        let span = info_span!("upgrade", client_ip = %client_ip, upstream = %url);
        state.sessions.spawn(
            tunnel(client_upgrade, upstream_response, state.shutdown.child_token())
                .instrument(span),
        );

        let mut response = Response::new(Body::empty());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        return response;
    }

    let mut response = Response::new(Body::from_stream(upstream_response.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Splice the client's and the upstream's upgraded connections.
async fn tunnel(
    client: OnUpgrade,
    upstream: reqwest::Response,
    session: CancellationToken,
) {
    let upgraded = async {
        let upstream = upstream.upgrade().await.map_err(|e| e.to_string())?;
        let client = client.await.map_err(|e| e.to_string())?;
        Ok::<_, String>((TokioIo::new(client), upstream))
    };
    let (client, upstream) = tokio::select! {
        _ = session.cancelled() => return,
        result = upgraded => match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Upgrade failed");
                return;
            }
        },
    };

    debug!("Upgraded connection open");
    let stats = splice(client, upstream, &session, None).await;
    debug!(
        bytes_to_upstream = stats.to_target,
        bytes_from_upstream = stats.from_target,
        "Upgraded connection closed"
    );
}
