//! Host routed HTTP(S) side of the gateway.
//!
//! - `server`: web listeners, TLS termination and graceful connection close
//! - `dispatch`: per-request host resolution, firewall and validation checks
//! - `reverse`: reverse proxy to upstream URLs
//! - `static_files`: file and directory routes
//! - `portal`: the authentication portal (assets and `/auth`)
//! - `keepalive`: the server-sent event stream that holds a whitelist lease

mod dispatch;
mod error;
mod keepalive;
mod portal;
mod reverse;
mod server;
mod static_files;
mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower_http::trace::TraceLayer;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::auth::Authenticator;
use crate::firewall::{AccessRegistry, FirewallPolicy};
use crate::proxy::RouteTable;

pub use error::ApiError;
pub use keepalive::{CLOSE_GRACE, DEFAULT_HEARTBEAT_INTERVAL};
pub use reverse::Upstream;
pub use server::WebListener;
pub use tls::load_server_config;

/// Per-connection facts attached to every request as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Client address.
    pub peer: SocketAddr,
    /// Local address the connection was accepted on.
    pub local: SocketAddr,
    /// Whether the connection was TLS terminated.
    pub tls: bool,
}

/// Authentication portal settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalConfig {
    /// Normalized portal host; always reachable without a whitelist entry.
    pub host: String,
    /// Directory holding `index.html`, `styles.css` and `script_v2.js`.
    pub static_dir: PathBuf,
}

/// Shared state for every web listener.
#[derive(Clone)]
pub struct WebState {
    pub routes: Arc<RouteTable>,
    pub registry: Arc<AccessRegistry>,
    pub firewall: FirewallPolicy,
    pub portal: Option<Arc<PortalConfig>>,
    pub authenticator: Arc<dyn Authenticator>,
    pub upstream: Upstream,
    /// Cancelled when the gateway shuts down.
    pub shutdown: CancellationToken,
    /// Tracks keep-alive sessions so shutdown can wait for them.
    pub sessions: TaskTracker,
    pub heartbeat_interval: Duration,
}

/// Build the router serving every web port.
pub fn router(state: WebState) -> Router {
    Router::new()
        .fallback(dispatch::dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
