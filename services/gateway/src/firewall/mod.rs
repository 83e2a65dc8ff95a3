//! IP whitelist firewall.
//!
//! - [`AccessRegistry`] holds the whitelist and the active raw connections.
//! - [`FirewallPolicy`] decides whether the whitelist is enforced at all.
//! - [`validate_input`] is the allow-list check applied to request data.

mod registry;
mod validation;

use std::net::IpAddr;
use std::sync::Arc;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub use registry::{AccessRegistry, ConnectionId, Registration};
pub use validation::{validate_input, InputKind};

/// Firewall policy from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct FirewallPolicy {
    /// Whether the firewall is active at all.
    #[serde(rename = "enable_firewall", default)]
    pub enabled: bool,
    /// Allow every client even while the firewall is active.
    #[serde(default)]
    pub default_allow: bool,
}

impl FirewallPolicy {
    /// Whether clients must be whitelisted to get through.
    pub fn enforces_whitelist(&self) -> bool {
        self.enabled && !self.default_allow
    }

    /// Admit a new raw connection from `ip`.
    ///
    /// Every admitted connection is registered, so a later revoke for the IP
    /// can evict it. Returns `None` when the whitelist is enforced and `ip`
    /// is not on it.
    pub fn admit(
        &self,
        registry: &Arc<AccessRegistry>,
        ip: IpAddr,
        closer: CancellationToken,
    ) -> Option<Registration> {
        if self.enforces_whitelist() {
            registry.check_and_register(ip, closer)
        } else {
            Some(registry.register(ip, closer))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_enforcement() {
        let off = FirewallPolicy::default();
        assert!(!off.enforces_whitelist());

        let open = FirewallPolicy {
            enabled: true,
            default_allow: true,
        };
        assert!(!open.enforces_whitelist());

        let strict = FirewallPolicy {
            enabled: true,
            default_allow: false,
        };
        assert!(strict.enforces_whitelist());
    }

    #[test]
    fn test_admit_follows_policy() {
        let registry = Arc::new(AccessRegistry::new());
        let client: IpAddr = "203.0.113.5".parse().unwrap();

        let strict = FirewallPolicy {
            enabled: true,
            default_allow: false,
        };
        assert!(strict
            .admit(&registry, client, CancellationToken::new())
            .is_none());

        let open = FirewallPolicy {
            enabled: true,
            default_allow: true,
        };
        let reg = open
            .admit(&registry, client, CancellationToken::new())
            .expect("default allow admits everyone");
        assert_eq!(registry.active_connections(client), 1);
        drop(reg);
        assert!(!registry.has_active_entry(client));
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: FirewallPolicy =
            serde_json::from_str(r#"{"enable_firewall": true, "default_allow": false}"#).unwrap();
        assert!(policy.enforces_whitelist());

        let policy: FirewallPolicy = serde_json::from_str("{}").unwrap();
        assert!(!policy.enabled);
    }
}
