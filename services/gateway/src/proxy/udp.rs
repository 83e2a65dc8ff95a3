//! Raw UDP relay.
//!
//! UDP has no accept, so each new client peer (source address) is treated
//! as a connection: the firewall is consulted on its first datagram, an
//! upstream socket is connected for it, and a session task relays in both
//! directions until the peer goes idle, its registration is revoked, or
//! the listener shuts down.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::backend::Backend;
use super::listener::{ListenerConfig, ListenerStats, SessionContext};
use crate::firewall::{AccessRegistry, FirewallPolicy, Registration};

/// Default idle timeout for a UDP peer session.
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_DATAGRAM: usize = 64 * 1024;
const PEER_QUEUE_DEPTH: usize = 256;

type PeerMap = Arc<Mutex<HashMap<SocketAddr, mpsc::Sender<Bytes>>>>;

/// A raw UDP listener.
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    ctx: SessionContext,
    max_peers: usize,
    peers: PeerMap,
}

impl UdpListener {
    /// Bind the listener.
    pub async fn bind(
        config: ListenerConfig,
        registry: Arc<AccessRegistry>,
        policy: FirewallPolicy,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = socket.local_addr()?;

        info!(
            bind_addr = %local_addr,
            backend_addr = %config.backend.addr,
            "UDP listener bound"
        );

        Ok(Self {
            socket: Arc::new(socket),
            max_peers: config.max_connections,
            peers: Arc::new(Mutex::new(HashMap::new())),
            ctx: SessionContext {
                registry,
                policy,
                backend: Arc::new(config.backend),
                stats: Arc::new(ListenerStats::default()),
                idle_timeout: Some(config.idle_timeout.unwrap_or(DEFAULT_UDP_IDLE_TIMEOUT)),
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Relay datagrams until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken, tracker: TaskTracker) {
        let local_addr = self.local_addr().ok();
        info!(bind_addr = ?local_addr, "UDP listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((n, peer)) => {
                    let datagram = Bytes::copy_from_slice(&buf[..n]);
                    self.dispatch(datagram, peer, &shutdown, &tracker);
                }
                Err(e) => {
                    // ICMP errors surface here on some platforms; not fatal.
                    debug!(error = %e, "UDP receive error");
                }
            }
        }

        info!(bind_addr = ?local_addr, "UDP listener closed");
    }

    fn dispatch(
        &self,
        datagram: Bytes,
        peer: SocketAddr,
        shutdown: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(sender) = peers.get(&peer) {
            if sender.try_send(datagram).is_err() {
                debug!(peer = %peer, "UDP peer queue full or closed, dropping datagram");
            }
            return;
        }

        let stats = &self.ctx.stats;
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);

        if peers.len() >= self.max_peers {
            stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %peer, "UDP peer rejected: max peers reached");
            return;
        }

        let client_ip = peer.ip().to_canonical();
        let session = shutdown.child_token();
        let Some(registration) =
            self.ctx
                .policy
                .admit(&self.ctx.registry, client_ip, session.clone())
        else {
            stats.connections_blocked.fetch_add(1, Ordering::Relaxed);
            info!(client_ip = %client_ip, "UDP peer blocked by firewall");
            return;
        };

        let (sender, receiver) = mpsc::channel(PEER_QUEUE_DEPTH);
        // First datagram goes in before the session starts reading.
        let _ = sender.try_send(datagram);
        peers.insert(peer, sender.clone());
        drop(peers);

        stats.session_started();
        let span = tracing::info_span!(
            "udp_session",
            peer = %peer,
            client_ip = %registration.ip(),
            connection_id = %registration.id()
        );
        let relay = PeerRelay {
            ctx: self.ctx.clone(),
            socket: Arc::clone(&self.socket),
            peers: Arc::clone(&self.peers),
            peer,
            sender,
        };
        tracker.spawn(relay.run(receiver, session, registration).instrument(span));
    }
}

struct PeerRelay {
    ctx: SessionContext,
    socket: Arc<UdpSocket>,
    peers: PeerMap,
    peer: SocketAddr,
    sender: mpsc::Sender<Bytes>,
}

impl PeerRelay {
    async fn run(
        self,
        receiver: mpsc::Receiver<Bytes>,
        session: CancellationToken,
        registration: Registration,
    ) {
        let (to_target, from_target) = self.relay(receiver, &session).await;
        self.ctx.stats.session_finished(to_target, from_target);

        // Only remove our own entry; the peer may already have a new session.
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        if peers
            .get(&self.peer)
            .is_some_and(|current| current.same_channel(&self.sender))
        {
            peers.remove(&self.peer);
        }
        drop(peers);
        drop(registration);

        debug!(
            bytes_to_target = to_target,
            bytes_from_target = from_target,
            "UDP session closed"
        );
    }

    async fn relay(
        &self,
        mut receiver: mpsc::Receiver<Bytes>,
        session: &CancellationToken,
    ) -> (u64, u64) {
        let upstream = tokio::select! {
            _ = session.cancelled() => return (0, 0),
            upstream = self.ctx.backend.connect_udp() => upstream,
        };
        let upstream = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                self.ctx.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(backend_addr = %self.ctx.backend.addr, error = %e, "Backend connection failed");
                return (0, 0);
            }
        };

        let idle = self.ctx.idle_timeout.unwrap_or(DEFAULT_UDP_IDLE_TIMEOUT);
        let mut to_target = 0u64;
        let mut from_target = 0u64;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = session.cancelled() => break,
                _ = tokio::time::sleep(idle) => {
                    debug!("UDP session idle");
                    break;
                }
                datagram = receiver.recv() => {
                    let Some(datagram) = datagram else { break };
                    match upstream.send(&datagram).await {
                        Ok(n) => to_target += n as u64,
                        Err(e) => {
                            debug!(error = %e, "UDP send to backend failed");
                            break;
                        }
                    }
                }
                received = upstream.recv(&mut buf) => {
                    match received {
                        Ok(n) => {
                            if let Err(e) = self.socket.send_to(&buf[..n], self.peer).await {
                                debug!(error = %e, "UDP send to peer failed");
                                break;
                            }
                            from_target += n as u64;
                        }
                        Err(e) => {
                            debug!(error = %e, "UDP receive from backend failed");
                            break;
                        }
                    }
                }
            }
        }

        session.cancel();
        (to_target, from_target)
    }
}

/// Convenience for building a UDP listener config with the UDP idle default.
pub fn udp_config(bind_addr: SocketAddr, backend: Backend) -> ListenerConfig {
    let mut config = ListenerConfig::new(bind_addr, backend);
    config.idle_timeout = Some(DEFAULT_UDP_IDLE_TIMEOUT);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    async fn echo_backend() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    async fn start(
        registry: Arc<AccessRegistry>,
        policy: FirewallPolicy,
        idle: Duration,
    ) -> (SocketAddr, CancellationToken, TaskTracker) {
        let backend = echo_backend().await;
        let mut config = udp_config("127.0.0.1:0".parse().unwrap(), Backend::new(backend.to_string()));
        config.idle_timeout = Some(idle);
        let listener = UdpListener::bind(config, registry, policy).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(listener.run(shutdown.clone(), tracker.clone()));
        (addr, shutdown, tracker)
    }

    #[tokio::test]
    async fn test_udp_relay_round_trip() {
        let registry = Arc::new(AccessRegistry::new());
        let (addr, shutdown, tracker) =
            start(Arc::clone(&registry), FirewallPolicy::default(), Duration::from_secs(5)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        client.send(b"hello").await.unwrap();

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("echo reply")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        assert_eq!(registry.active_connections(localhost), 1);

        shutdown.cancel();
        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), tracker.wait())
            .await
            .expect("udp tasks should stop");
        assert!(!registry.has_active_entry(localhost));
    }

    #[tokio::test]
    async fn test_udp_idle_session_unregisters() {
        let registry = Arc::new(AccessRegistry::new());
        let (addr, shutdown, _tracker) = start(
            Arc::clone(&registry),
            FirewallPolicy::default(),
            Duration::from_millis(100),
        )
        .await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", addr).await.unwrap();

        let localhost: IpAddr = "127.0.0.1".parse().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !registry.has_active_entry(localhost) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            while registry.has_active_entry(localhost) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("idle udp session should end");
        assert_eq!(registry.total_connections(), 0);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_udp_blocked_peer_never_reaches_backend() {
        let registry = Arc::new(AccessRegistry::new());
        let strict = FirewallPolicy {
            enabled: true,
            default_allow: false,
        };
        let (addr, shutdown, _tracker) =
            start(Arc::clone(&registry), strict, Duration::from_secs(5)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(addr).await.unwrap();
        client.send(b"hello").await.unwrap();

        let mut buf = [0u8; 64];
        let reply = tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf)).await;
        assert!(reply.is_err() || reply.unwrap().is_err());
        assert_eq!(registry.total_connections(), 0);
        shutdown.cancel();
    }
}
