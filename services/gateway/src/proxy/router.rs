//! Route table and conflict resolution.
//!
//! The table is built once at startup from the expanded endpoint list and is
//! read-only afterwards, so lookups take no locks.
//!
//! - Raw (tcp/udp) routes are keyed by port and own that port exclusively.
//! - Web routes are keyed by port + hostname; many hosts share one listener.
//! - Hostnames are normalized to lowercase with the trailing dot trimmed.
//! - Conflicting claims fail the build instead of picking a winner.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use axum::http::{HeaderName, HeaderValue};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::RouteConflict;

/// Listener protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Raw TCP splice.
    Tcp,
    /// Raw UDP relay.
    Udp,
    /// Host routed HTTP(S).
    Web,
}

impl Protocol {
    pub fn is_raw(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Web => "web",
        };
        f.write_str(name)
    }
}

/// Internal endpoints served by the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuncRoute {
    /// Authentication portal: assets, `/auth` and the keep-alive stream.
    Portal,
}

impl FuncRoute {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "portal" => Some(FuncRoute::Portal),
            _ => None,
        }
    }
}

/// How a matched web route is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Reverse proxy to the target URL.
    Proxy,
    /// Files from the target path.
    Static,
    /// Permanent redirect to the target URL.
    Redirect,
    /// Internal endpoint.
    Func(FuncRoute),
}

impl RouteKind {
    fn parse(route_type: Option<&str>, target: &str) -> Result<Self, String> {
        match route_type.map(str::trim) {
            Some("proxy") => Ok(RouteKind::Proxy),
            Some("static") => Ok(RouteKind::Static),
            Some("redirect") => Ok(RouteKind::Redirect),
            Some("func") => FuncRoute::from_name(target.trim())
                .map(RouteKind::Func)
                .ok_or_else(|| format!("unknown func route '{}'", target)),
            Some(other) => Err(format!("unknown route type '{}'", other)),
            None => Err("web endpoints need a route type".to_string()),
        }
    }
}

/// A configured listen target, after multi-value expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub listen_addr: SocketAddr,
    /// Hostname routed on a web listener.
    pub host: Option<String>,
    /// Explicit TLS flag; when unset TLS follows the TLS policy domains.
    pub tls: Option<bool>,
    /// Raw forward address, upstream URL, static path or func name.
    pub target: String,
    /// Route type for web endpoints (`proxy`, `static`, `redirect`, `func`).
    pub route_type: Option<String>,
    pub allow_insecure: bool,
    pub no_headers: bool,
    pub strip_prefix: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl Endpoint {
    /// A raw forwarding endpoint.
    pub fn raw(protocol: Protocol, listen_addr: SocketAddr, target: impl Into<String>) -> Self {
        Self {
            protocol,
            listen_addr,
            host: None,
            tls: None,
            target: target.into(),
            route_type: None,
            allow_insecure: false,
            no_headers: false,
            strip_prefix: None,
            headers: BTreeMap::new(),
        }
    }

    /// A host routed web endpoint.
    pub fn web(
        listen_addr: SocketAddr,
        host: impl Into<String>,
        route_type: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            protocol: Protocol::Web,
            listen_addr,
            host: Some(host.into()),
            tls: None,
            target: target.into(),
            route_type: Some(route_type.into()),
            allow_insecure: false,
            no_headers: false,
            strip_prefix: None,
            headers: BTreeMap::new(),
        }
    }
}

/// TLS policy from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsPolicy {
    #[serde(rename = "enable_tls", default)]
    pub enabled: bool,
    #[serde(default)]
    pub cert_file: String,
    #[serde(default)]
    pub key_file: String,
    /// Hosts served over TLS.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl TlsPolicy {
    fn covers(&self, host: &str) -> bool {
        self.enabled
            && self
                .domains
                .iter()
                .any(|d| RouteTable::normalize_hostname(d) == host)
    }
}

/// Per-route flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFlags {
    /// Skip upstream TLS verification. Opt-in per route.
    pub allow_insecure_upstream: bool,
    /// Do not add the hardening headers.
    pub strip_headers: bool,
    /// Path prefix removed before forwarding or serving.
    pub strip_prefix: Option<String>,
}

/// Key for route lookup (port + optional hostname).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub port: u16,
    pub hostname: Option<String>,
}

/// A resolved route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub key: RouteKey,
    pub protocol: Protocol,
    pub kind: RouteKind,
    pub target: String,
    /// Whether the route is served over TLS (web only).
    pub tls: bool,
    pub flags: RouteFlags,
    /// Extra response headers.
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub bind_addr: SocketAddr,
}

impl RouteDescriptor {
    /// Routes describing the same thing are merged instead of conflicting.
    fn same_route(&self, other: &RouteDescriptor) -> bool {
        self.kind == other.kind
            && self.target == other.target
            && self.tls == other.tls
            && self.flags == other.flags
            && self.headers == other.headers
    }
}

/// TLS mode a web listener must speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebPortMode {
    Plain,
    Tls,
    /// Both; TLS is detected per connection.
    Mixed,
}

/// A web listener shared by every host routed on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebPort {
    pub port: u16,
    pub bind_addr: SocketAddr,
    pub tls_hosts: usize,
    pub plain_hosts: usize,
}

impl WebPort {
    pub fn mode(&self) -> WebPortMode {
        match (self.tls_hosts > 0, self.plain_hosts > 0) {
            (true, true) => WebPortMode::Mixed,
            (true, false) => WebPortMode::Tls,
            _ => WebPortMode::Plain,
        }
    }
}

#[derive(Debug, Clone)]
enum PortClaim {
    Raw,
    Web(WebPort),
}

/// Immutable routing state for the process lifetime.
#[derive(Debug, Default)]
pub struct RouteTable {
    /// Routes indexed by (port, hostname).
    by_key: HashMap<RouteKey, RouteDescriptor>,
    /// Which kind of listener owns each port.
    ports: BTreeMap<u16, PortClaim>,
}

impl RouteTable {
    /// Normalize a hostname for matching.
    ///
    /// - Convert to lowercase
    /// - Trim trailing dot
    pub fn normalize_hostname(hostname: &str) -> String {
        hostname.trim().to_lowercase().trim_end_matches('.').to_string()
    }

    /// Build the table, failing on the first conflicting claim.
    pub fn build(endpoints: &[Endpoint], tls: &TlsPolicy) -> Result<Self, RouteConflict> {
        let mut table = RouteTable::default();

        for endpoint in endpoints {
            if endpoint.protocol.is_raw() {
                table.insert_raw(endpoint)?;
            } else {
                table.insert_web(endpoint, tls)?;
            }
        }

        info!(
            route_count = table.by_key.len(),
            port_count = table.ports.len(),
            "Route table built"
        );
        Ok(table)
    }

    fn insert_raw(&mut self, endpoint: &Endpoint) -> Result<(), RouteConflict> {
        let port = endpoint.listen_addr.port();

        match self.ports.get(&port) {
            Some(PortClaim::Web(_)) => return Err(RouteConflict::RawAndWeb { port }),
            Some(PortClaim::Raw) => return Err(RouteConflict::DuplicateRaw { port }),
            None => {}
        }
        if endpoint.target.trim().is_empty() {
            return Err(RouteConflict::InvalidEndpoint {
                port,
                detail: format!("{} endpoint has no target address", endpoint.protocol),
            });
        }

        let key = RouteKey {
            port,
            hostname: None,
        };
        let descriptor = RouteDescriptor {
            key: key.clone(),
            protocol: endpoint.protocol,
            kind: RouteKind::Proxy,
            target: endpoint.target.trim().to_string(),
            tls: false,
            flags: RouteFlags::default(),
            headers: Vec::new(),
            bind_addr: endpoint.listen_addr,
        };

        debug!(port, protocol = %endpoint.protocol, target = %descriptor.target, "Raw route added");
        self.ports.insert(port, PortClaim::Raw);
        self.by_key.insert(key, descriptor);
        Ok(())
    }

    fn insert_web(&mut self, endpoint: &Endpoint, tls: &TlsPolicy) -> Result<(), RouteConflict> {
        let port = endpoint.listen_addr.port();
        let invalid = |detail: String| RouteConflict::InvalidEndpoint { port, detail };

        let host = endpoint
            .host
            .as_deref()
            .map(Self::normalize_hostname)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("web endpoint has no listen url".to_string()))?;
        let kind =
            RouteKind::parse(endpoint.route_type.as_deref(), &endpoint.target).map_err(invalid)?;
        let headers = parse_headers(&endpoint.headers).map_err(invalid)?;
        let is_tls = endpoint.tls.unwrap_or_else(|| tls.covers(&host));

        let key = RouteKey {
            port,
            hostname: Some(host.clone()),
        };
        let descriptor = RouteDescriptor {
            key: key.clone(),
            protocol: Protocol::Web,
            kind,
            target: endpoint.target.trim().to_string(),
            tls: is_tls,
            flags: RouteFlags {
                allow_insecure_upstream: endpoint.allow_insecure,
                strip_headers: endpoint.no_headers,
                strip_prefix: endpoint.strip_prefix.clone().filter(|p| !p.is_empty()),
            },
            headers,
            bind_addr: endpoint.listen_addr,
        };

        let claim = self.ports.entry(port).or_insert_with(|| {
            PortClaim::Web(WebPort {
                port,
                bind_addr: endpoint.listen_addr,
                tls_hosts: 0,
                plain_hosts: 0,
            })
        });
        let web_port = match claim {
            PortClaim::Raw => return Err(RouteConflict::RawAndWeb { port }),
            PortClaim::Web(existing) if existing.bind_addr != endpoint.listen_addr => {
                return Err(RouteConflict::BindMismatch {
                    port,
                    first: existing.bind_addr,
                    second: endpoint.listen_addr,
                });
            }
            PortClaim::Web(existing) => existing,
        };

        if let Some(existing) = self.by_key.get(&key) {
            if existing.tls != descriptor.tls {
                return Err(RouteConflict::MixedTls { port, host });
            }
            if !existing.same_route(&descriptor) {
                return Err(RouteConflict::DuplicateHost { port, host });
            }
            debug!(port, host = %host, "Duplicate web route merged");
            return Ok(());
        }

        if is_tls {
            web_port.tls_hosts += 1;
        } else {
            web_port.plain_hosts += 1;
        }

        debug!(port, host = %host, kind = ?descriptor.kind, tls = is_tls, "Web route added");
        self.by_key.insert(key, descriptor);
        Ok(())
    }

    /// Raw route owning `port`.
    pub fn raw_route(&self, port: u16) -> Option<&RouteDescriptor> {
        self.by_key.get(&RouteKey {
            port,
            hostname: None,
        })
    }

    /// Web route for `host` (already normalized) on `port`.
    pub fn web_route(&self, port: u16, host: &str) -> Option<&RouteDescriptor> {
        self.by_key.get(&RouteKey {
            port,
            hostname: Some(host.to_string()),
        })
    }

    /// All raw routes, in port order.
    pub fn raw_routes(&self) -> impl Iterator<Item = &RouteDescriptor> {
        self.ports
            .iter()
            .filter(|(_, claim)| matches!(claim, PortClaim::Raw))
            .filter_map(|(port, _)| self.raw_route(*port))
    }

    /// All web listeners, in port order.
    pub fn web_ports(&self) -> impl Iterator<Item = &WebPort> {
        self.ports.values().filter_map(|claim| match claim {
            PortClaim::Web(web) => Some(web),
            PortClaim::Raw => None,
        })
    }

    /// Total number of routes.
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

fn parse_headers(headers: &BTreeMap<String, String>) -> Result<Vec<(HeaderName, HeaderValue)>, String> {
    headers
        .iter()
        .map(|(name, value)| {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| format!("invalid header name '{}'", name))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|_| format!("invalid value for header '{}'", name))?;
            Ok((name, value))
        })
        .collect()
}
