//! Whitelist and active-connection registry.
//!
//! The registry is the only cross-task mutable state in the gateway. Both
//! maps live behind a single lock and are always mutated in the same
//! critical section, so a grant check and a connection registration can never
//! straddle a revoke.
//!
//! Connections are tracked by stable [`ConnectionId`]s: `by_ip` maps an IP to
//! the set of its live IDs and `connections` owns the handles. A handle is a
//! [`CancellationToken`] owned by the raw session; cancelling it closes both
//! sockets of that session.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Stable identifier of a registered raw connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct ConnectionHandle {
    ip: IpAddr,
    closer: CancellationToken,
}

#[derive(Debug, Default)]
struct RegistryState {
    whitelist: HashSet<IpAddr>,
    by_ip: HashMap<IpAddr, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, ConnectionHandle>,
}

impl RegistryState {
    fn insert(&mut self, id: ConnectionId, ip: IpAddr, closer: CancellationToken) {
        self.by_ip.entry(ip).or_default().insert(id);
        self.connections.insert(id, ConnectionHandle { ip, closer });
    }
}

/// Process-wide access-control state.
#[derive(Debug, Default)]
pub struct AccessRegistry {
    state: RwLock<RegistryState>,
    next_id: AtomicU64,
}

impl AccessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `closer` for `ip` if, and only if, `ip` is whitelisted.
    ///
    /// The whitelist lookup and the registration happen under one write
    /// lock. The returned [`Registration`] unregisters the connection when
    /// dropped.
    pub fn check_and_register(
        self: &Arc<Self>,
        ip: IpAddr,
        closer: CancellationToken,
    ) -> Option<Registration> {
        let id = self.allocate_id();
        let mut state = self.write();
        if !state.whitelist.contains(&ip) {
            return None;
        }
        state.insert(id, ip, closer);
        drop(state);

        debug!(ip = %ip, connection_id = %id, "Connection registered");
        Some(Registration {
            registry: Arc::clone(self),
            ip,
            id,
        })
    }

    /// Register `closer` for `ip` without consulting the whitelist.
    ///
    /// Used when the firewall does not enforce the whitelist, so that every
    /// live raw connection is still tracked and can be evicted.
    pub fn register(self: &Arc<Self>, ip: IpAddr, closer: CancellationToken) -> Registration {
        let id = self.allocate_id();
        self.write().insert(id, ip, closer);

        debug!(ip = %ip, connection_id = %id, "Connection registered (unchecked)");
        Registration {
            registry: Arc::clone(self),
            ip,
            id,
        }
    }

    /// Whitelist lookup without mutation.
    pub fn check_only(&self, ip: IpAddr) -> bool {
        self.read().whitelist.contains(&ip)
    }

    /// Whitelist `ip`. Idempotent.
    pub fn grant(&self, ip: IpAddr) {
        let newly_granted = self.write().whitelist.insert(ip);
        if newly_granted {
            info!(ip = %ip, "IP whitelisted");
        }
    }

    /// Remove `ip` from the whitelist and close every connection registered
    /// for it. Idempotent: revoking an absent IP is a no-op.
    ///
    /// Returns the number of connections that were closed.
    pub fn revoke(&self, ip: IpAddr) -> usize {
        let mut state = self.write();
        let was_whitelisted = state.whitelist.remove(&ip);

        let ids = state.by_ip.remove(&ip).unwrap_or_default();
        let mut closed = 0;
        for id in ids {
            if let Some(handle) = state.connections.remove(&id) {
                debug!(ip = %handle.ip, connection_id = %id, "Closing evicted connection");
                handle.closer.cancel();
                closed += 1;
            }
        }
        drop(state);

        if was_whitelisted || closed > 0 {
            info!(ip = %ip, closed_connections = closed, "IP removed from whitelist");
        }
        closed
    }

    /// Remove one connection. The IP's entry is deleted once its last
    /// connection is gone. A connection already evicted by [`revoke`] is
    /// simply absent, so this never recreates a revoked key.
    ///
    /// [`revoke`]: AccessRegistry::revoke
    pub fn unregister(&self, ip: IpAddr, id: ConnectionId) {
        let mut state = self.write();
        if state.connections.remove(&id).is_none() {
            return;
        }
        if let Some(ids) = state.by_ip.get_mut(&ip) {
            ids.remove(&id);
            if ids.is_empty() {
                state.by_ip.remove(&ip);
            }
        }
        drop(state);

        debug!(ip = %ip, connection_id = %id, "Connection unregistered");
    }

    /// Number of live connections registered for `ip`.
    pub fn active_connections(&self, ip: IpAddr) -> usize {
        self.read().by_ip.get(&ip).map_or(0, HashSet::len)
    }

    /// Whether `ip` has an entry in the active-connection table.
    pub fn has_active_entry(&self, ip: IpAddr) -> bool {
        self.read().by_ip.contains_key(&ip)
    }

    /// Total number of live registered connections.
    pub fn total_connections(&self) -> usize {
        self.read().connections.len()
    }

    /// Number of whitelisted IPs.
    pub fn whitelist_len(&self) -> usize {
        self.read().whitelist.len()
    }

    #[cfg(test)]
    fn owner_of(&self, id: ConnectionId) -> Option<IpAddr> {
        self.read().connections.get(&id).map(|h| h.ip)
    }
}

/// A live registration in the active-connection table.
///
/// Dropping it unregisters the connection, so every raw teardown path
/// unregisters exactly once.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<AccessRegistry>,
    ip: IpAddr,
    id: ConnectionId,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.ip, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_check_and_register_requires_grant() {
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("203.0.113.5");

        assert!(registry
            .check_and_register(client, CancellationToken::new())
            .is_none());
        assert!(!registry.has_active_entry(client));

        registry.grant(client);
        let reg = registry
            .check_and_register(client, CancellationToken::new())
            .expect("whitelisted ip should register");

        assert_eq!(registry.active_connections(client), 1);
        assert_eq!(registry.owner_of(reg.id()), Some(client));
    }

    #[test]
    fn test_revoke_closes_and_removes() {
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("203.0.113.5");
        registry.grant(client);

        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        let regs: Vec<_> = tokens
            .iter()
            .map(|t| registry.check_and_register(client, t.clone()).unwrap())
            .collect();

        assert_eq!(registry.revoke(client), 3);
        assert!(!registry.check_only(client));
        assert!(!registry.has_active_entry(client));
        assert!(tokens.iter().all(CancellationToken::is_cancelled));

        // Teardown after eviction must not resurrect the key.
        drop(regs);
        assert!(!registry.has_active_entry(client));
        assert_eq!(registry.total_connections(), 0);
    }

    #[test]
    fn test_revoke_is_idempotent() {
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("203.0.113.5");
        registry.grant(client);
        let token = CancellationToken::new();
        let _reg = registry.check_and_register(client, token.clone()).unwrap();

        assert_eq!(registry.revoke(client), 1);
        assert_eq!(registry.revoke(client), 0);
        assert!(!registry.check_only(client));
        assert!(!registry.has_active_entry(client));
        assert!(token.is_cancelled());

        // Revoking an IP that was never seen is a no-op.
        assert_eq!(registry.revoke(ip("198.51.100.1")), 0);
    }

    #[test]
    fn test_unregister_drops_empty_entry() {
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("2001:db8::5");
        registry.grant(client);

        let first = registry
            .check_and_register(client, CancellationToken::new())
            .unwrap();
        let second = registry
            .check_and_register(client, CancellationToken::new())
            .unwrap();
        assert_ne!(first.id(), second.id());

        drop(first);
        assert_eq!(registry.active_connections(client), 1);
        drop(second);
        assert!(!registry.has_active_entry(client));

        // The grant itself is untouched by connection teardown.
        assert!(registry.check_only(client));
    }

    #[test]
    fn test_unchecked_register_is_evicted_by_revoke() {
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("192.0.2.10");
        let token = CancellationToken::new();

        let reg = registry.register(client, token.clone());
        assert_eq!(reg.ip(), client);
        assert_eq!(registry.active_connections(client), 1);

        registry.revoke(client);
        assert!(token.is_cancelled());
        assert!(!registry.has_active_entry(client));
    }

    #[test]
    fn test_grant_is_idempotent() {
        let registry = AccessRegistry::new();
        let client = ip("203.0.113.5");
        registry.grant(client);
        registry.grant(client);
        assert_eq!(registry.whitelist_len(), 1);
    }

    #[test]
    fn test_register_never_straddles_revoke() {
        // Every connection that registered successfully is either still
        // tracked with its token live, or was evicted with its token
        // cancelled. Nothing is left registered after the final revoke.
        let registry = Arc::new(AccessRegistry::new());
        let client = ip("203.0.113.5");
        registry.grant(client);

        let registrar = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let mut kept = Vec::new();
                for _ in 0..2_000 {
                    let token = CancellationToken::new();
                    if let Some(reg) = registry.check_and_register(client, token.clone()) {
                        kept.push((reg, token));
                    }
                }
                kept
            })
        };

        let revoker = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    registry.revoke(client);
                    registry.grant(client);
                }
                registry.revoke(client);
            })
        };

        revoker.join().unwrap();
        let kept = registrar.join().unwrap();

        // After the last revoke any registration that succeeded later would
        // have needed a grant, and there was none.
        for (_, token) in &kept {
            assert!(token.is_cancelled());
        }
        assert!(!registry.has_active_entry(client));
        drop(kept);
        assert_eq!(registry.total_connections(), 0);
    }
}
