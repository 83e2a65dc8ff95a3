//! Raw TCP listener and connection handling.
//!
//! One listener per raw route. The accept loop:
//! - applies the firewall policy to every new connection
//! - registers admitted connections so a revoke can evict them
//! - spawns one tracked task per session, never blocking the loop
//!
//! Shutdown closes the listener first (no new accepts); sessions observe
//! the same cancellation through their child tokens and close themselves.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::Backend;
use super::splice::splice;
use crate::firewall::{AccessRegistry, FirewallPolicy};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a raw listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Where accepted traffic is forwarded.
    pub backend: Backend,
    /// Maximum concurrent connections (TCP) or peers (UDP).
    pub max_connections: usize,
    /// Idle timeout for sessions. TCP sessions have none by default.
    pub idle_timeout: Option<Duration>,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, backend: Backend) -> Self {
        Self {
            bind_addr,
            backend,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: None,
        }
    }
}

/// Statistics for a raw listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted by the socket.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished.
    pub connections_closed: AtomicU64,
    /// Connections dropped by the firewall.
    pub connections_blocked: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Backend connection failures.
    pub backend_failed: AtomicU64,
    /// Bytes proxied to the target.
    pub bytes_to_target: AtomicU64,
    /// Bytes proxied from the target.
    pub bytes_from_target: AtomicU64,
}

impl ListenerStats {
    pub(crate) fn session_started(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn session_finished(&self, to_target: u64, from_target: u64) {
        self.bytes_to_target.fetch_add(to_target, Ordering::Relaxed);
        self.bytes_from_target
            .fetch_add(from_target, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Shared state every raw session needs.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub registry: Arc<AccessRegistry>,
    pub policy: FirewallPolicy,
    pub backend: Arc<Backend>,
    pub stats: Arc<ListenerStats>,
    pub idle_timeout: Option<Duration>,
}

/// A raw TCP listener.
pub struct Listener {
    listener: TcpListener,
    ctx: SessionContext,
    conn_semaphore: Arc<Semaphore>,
}

impl Listener {
    /// Bind the listener.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<AccessRegistry>,
        policy: FirewallPolicy,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backend_addr = %config.backend.addr,
            max_connections = config.max_connections,
            "TCP listener bound"
        );

        Ok(Self {
            listener,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            ctx: SessionContext {
                registry,
                policy,
                backend: Arc::new(config.backend),
                stats: Arc::new(ListenerStats::default()),
                idle_timeout: config.idle_timeout,
            },
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Consumes the listener: the socket is closed as soon as the loop
    /// exits, while sessions spawned on `tracker` keep running until their
    /// own tokens (children of `shutdown`) are cancelled.
    pub async fn run(self, shutdown: CancellationToken, tracker: TaskTracker) {
        let local_addr = self.local_addr().ok();
        info!(bind_addr = ?local_addr, "TCP listener started");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer_addr)) => self.admit(stream, peer_addr, &shutdown, &tracker),
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(bind_addr = ?local_addr, "TCP listener closed");
    }

    fn admit(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        let stats = &self.ctx.stats;
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

        let permit = match Arc::clone(&self.conn_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                return;
            }
        };

        let client_ip = peer_addr.ip().to_canonical();
        let session = shutdown.child_token();
        let Some(registration) =
            self.ctx
                .policy
                .admit(&self.ctx.registry, client_ip, session.clone())
        else {
            stats.connections_blocked.fetch_add(1, Ordering::Relaxed);
            info!(client_ip = %client_ip, "Connection blocked by firewall");
            return;
        };

        stats.session_started();
        let ctx = self.ctx.clone();
        let span = tracing::info_span!(
            "connection",
            peer = %peer_addr,
            client_ip = %registration.ip(),
            connection_id = %registration.id()
        );

        tracker.spawn(
            async move {
                let (to_target, from_target) = handle_connection(&ctx, stream, &session).await;
                ctx.stats.session_finished(to_target, from_target);
                // Unregisters from the access registry.
                drop(registration);
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Run one spliced session. Returns (bytes_to_target, bytes_from_target).
async fn handle_connection(
    ctx: &SessionContext,
    client: TcpStream,
    session: &CancellationToken,
) -> (u64, u64) {
    let target = tokio::select! {
        _ = session.cancelled() => return (0, 0),
        target = ctx.backend.connect_tcp() => target,
    };

    let target = match target {
        Ok(target) => target,
        Err(e) => {
            ctx.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
            warn!(backend_addr = %ctx.backend.addr, error = %e, "Backend connection failed");
            return (0, 0);
        }
    };

    let _ = client.set_nodelay(true);
    let _ = target.set_nodelay(true);
    debug!(backend_addr = %ctx.backend.addr, "Connected to backend");

    let stats = splice(client, target, session, ctx.idle_timeout).await;

    debug!(
        bytes_to_target = stats.to_target,
        bytes_from_target = stats.from_target,
        "Connection closed"
    );
    (stats.to_target, stats.from_target)
}
