//! Listener lifecycle.
//!
//! [`Gateway::start`] builds the route table, binds every listener and
//! spawns them under one cancellation root:
//!
//! ```text
//! root token
//!  ├── raw listener token ── session token (one per connection / UDP peer)
//!  ├── web listener token ── connection (graceful close on cancel)
//!  └── keep-alive token ──── SSE session (sends `close`, then ends)
//! ```
//!
//! Every task is spawned on one [`TaskTracker`], so [`Gateway::shutdown`]
//! can wait for all of them with a deadline. Raw listener totals are logged
//! once everything has stopped.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::config::{Config, GatewayFile};
use crate::error::{GatewayError, Result};
use crate::firewall::{AccessRegistry, FirewallPolicy};
use crate::proxy::{
    udp_config, Backend, Endpoint, Listener, ListenerConfig, ListenerStats, Protocol, RouteTable,
    TlsPolicy, UdpListener, WebPortMode, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_UDP_IDLE_TIMEOUT,
};
use crate::web::{
    self, load_server_config, PortalConfig, Upstream, WebListener, WebState,
    DEFAULT_HEARTBEAT_INTERVAL,
};

/// Everything needed to start a gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub endpoints: Vec<Endpoint>,
    pub tls: TlsPolicy,
    pub firewall: FirewallPolicy,
    pub portal: Option<PortalConfig>,
    pub heartbeat_interval: Duration,
    /// Per raw listener limit on concurrent sessions.
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub udp_idle_timeout: Duration,
}

impl GatewaySettings {
    pub fn new(endpoints: Vec<Endpoint>, tls: TlsPolicy, firewall: FirewallPolicy) -> Self {
        Self {
            endpoints,
            tls,
            firewall,
            portal: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            udp_idle_timeout: DEFAULT_UDP_IDLE_TIMEOUT,
        }
    }

    /// Settings from the gateway file and process config.
    pub fn from_file(file: &GatewayFile, config: &Config) -> Result<Self> {
        let mut settings = Self::new(file.endpoints()?, file.tls.clone(), file.firewall);
        settings.portal = file.portal_host().map(|host| PortalConfig {
            host,
            static_dir: file.webserver.static_dir.clone(),
        });
        settings.heartbeat_interval = config.heartbeat_interval;
        Ok(settings)
    }
}

/// Address a listener actually bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundListener {
    pub protocol: Protocol,
    pub addr: SocketAddr,
}

enum RawListener {
    Tcp(Listener),
    Udp(UdpListener),
}

/// A running gateway.
pub struct Gateway {
    registry: Arc<AccessRegistry>,
    routes: Arc<RouteTable>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    listeners: Vec<BoundListener>,
    raw_stats: Vec<(BoundListener, Arc<ListenerStats>)>,
}

impl Gateway {
    /// Build routes, bind listeners and start serving.
    ///
    /// Route conflicts and raw bind failures abort startup. A web port that
    /// cannot bind, or needs TLS material that failed to load, is logged and
    /// skipped.
    pub async fn start(
        settings: GatewaySettings,
        authenticator: Arc<dyn Authenticator>,
    ) -> Result<Self> {
        let routes = Arc::new(RouteTable::build(&settings.endpoints, &settings.tls)?);
        info!(
            route_count = routes.len(),
            firewall_enabled = settings.firewall.enabled,
            default_allow = settings.firewall.default_allow,
            "Starting listeners"
        );

        let registry = Arc::new(AccessRegistry::new());
        let root = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut listeners = Vec::new();
        let mut raw_stats = Vec::new();

        let mut raw = Vec::new();
        for route in routes.raw_routes() {
            let backend =
                Backend::new(route.target.clone()).with_timeout(settings.connect_timeout);
            let bind_err = |source| GatewayError::Bind {
                addr: route.bind_addr,
                source,
            };
            let listener = match route.protocol {
                Protocol::Tcp => {
                    let mut config = ListenerConfig::new(route.bind_addr, backend);
                    config.max_connections = settings.max_connections;
                    let listener =
                        Listener::bind(config, Arc::clone(&registry), settings.firewall)
                            .await
                            .map_err(bind_err)?;
                    let bound = BoundListener {
                        protocol: Protocol::Tcp,
                        addr: listener.local_addr()?,
                    };
                    listeners.push(bound);
                    raw_stats.push((bound, listener.stats()));
                    RawListener::Tcp(listener)
                }
                Protocol::Udp => {
                    let mut config = udp_config(route.bind_addr, backend);
                    config.max_connections = settings.max_connections;
                    config.idle_timeout = Some(settings.udp_idle_timeout);
                    let listener =
                        UdpListener::bind(config, Arc::clone(&registry), settings.firewall)
                            .await
                            .map_err(bind_err)?;
                    let bound = BoundListener {
                        protocol: Protocol::Udp,
                        addr: listener.local_addr()?,
                    };
                    listeners.push(bound);
                    raw_stats.push((bound, listener.stats()));
                    RawListener::Udp(listener)
                }
                Protocol::Web => continue,
            };
            raw.push(listener);
        }

        let needs_tls = routes
            .web_ports()
            .any(|port| port.mode() != WebPortMode::Plain);
        let tls = if needs_tls {
            match load_server_config(&settings.tls) {
                Ok(config) => Some(config),
                Err(e) => {
                    error!(error = %e, "TLS unavailable, ports serving TLS hosts will not start");
                    None
                }
            }
        } else {
            None
        };

        let state = WebState {
            routes: Arc::clone(&routes),
            registry: Arc::clone(&registry),
            firewall: settings.firewall,
            portal: settings.portal.map(Arc::new),
            authenticator,
            upstream: Upstream::new()?,
            shutdown: root.child_token(),
            sessions: tracker.clone(),
            heartbeat_interval: settings.heartbeat_interval,
        };
        let router = web::router(state);

        let mut web_listeners = Vec::new();
        for port in routes.web_ports() {
            match WebListener::bind(port, tls.clone(), router.clone()).await {
                Ok(listener) => {
                    listeners.push(BoundListener {
                        protocol: Protocol::Web,
                        addr: listener.local_addr()?,
                    });
                    web_listeners.push(listener);
                }
                Err(e) => {
                    error!(
                        port = port.port,
                        reason = e.reason_code(),
                        error = %e,
                        "Web listener not started"
                    );
                }
            }
        }

        for listener in raw {
            match listener {
                RawListener::Tcp(listener) => {
                    tracker.spawn(listener.run(root.child_token(), tracker.clone()));
                }
                RawListener::Udp(listener) => {
                    tracker.spawn(listener.run(root.child_token(), tracker.clone()));
                }
            }
        }
        for listener in web_listeners {
            tracker.spawn(listener.run(root.child_token(), tracker.clone()));
        }

        info!(listener_count = listeners.len(), "Gateway started");

        Ok(Self {
            registry,
            routes,
            shutdown: root,
            tracker,
            listeners,
            raw_stats,
        })
    }

    pub fn registry(&self) -> &Arc<AccessRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Root token; cancelling it starts shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Every listener that bound, raw listeners first.
    pub fn listeners(&self) -> &[BoundListener] {
        &self.listeners
    }

    /// Counters of every raw listener, in [`Gateway::listeners`] order.
    pub fn raw_listener_stats(&self) -> &[(BoundListener, Arc<ListenerStats>)] {
        &self.raw_stats
    }

    /// Stop accepting, close every session and wait up to `grace` for all
    /// tasks to finish. Returns whether everything finished in time.
    pub async fn shutdown(self, grace: Duration) -> bool {
        info!(
            active_tasks = self.tracker.len(),
            active_connections = self.registry.total_connections(),
            "Shutting down gateway"
        );
        self.shutdown.cancel();
        self.tracker.close();

        let finished = match timeout(grace, self.tracker.wait()).await {
            Ok(()) => {
                info!("Gateway stopped");
                true
            }
            Err(_) => {
                warn!(
                    pending_tasks = self.tracker.len(),
                    "Shutdown deadline passed with tasks still running"
                );
                false
            }
        };
        self.log_listener_totals();
        finished
    }

    fn log_listener_totals(&self) {
        for (listener, stats) in &self.raw_stats {
            info!(
                protocol = ?listener.protocol,
                addr = %listener.addr,
                accepted = stats.connections_accepted.load(Ordering::Relaxed),
                blocked = stats.connections_blocked.load(Ordering::Relaxed),
                rejected = stats.connections_rejected.load(Ordering::Relaxed),
                backend_failed = stats.backend_failed.load(Ordering::Relaxed),
                still_active = stats.connections_active.load(Ordering::Relaxed),
                bytes_to_target = stats.bytes_to_target.load(Ordering::Relaxed),
                bytes_from_target = stats.bytes_from_target.load(Ordering::Relaxed),
                "Listener totals"
            );
        }
    }
}
