//! Portal credentials.
//!
//! Keys are stored as bcrypt hashes in `keys.json`:
//!
//! ```json
//! {"users": [{"name": "alice", "hash": "$2b$12$...", "allowed_sessions": 1}]}
//! ```
//!
//! `mazarin hash-key <key>` prints a value for the `hash` field.

use std::collections::HashMap;
use std::path::Path;

use bcrypt::DEFAULT_COST;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::firewall::{validate_input, InputKind};

/// Credential check used by the portal.
pub trait Authenticator: Send + Sync {
    /// Whether `key` is valid for `username`.
    fn authenticate(&self, username: &str, key: &str) -> bool;
}

#[derive(Debug, Clone, Deserialize)]
struct UserEntry {
    name: String,
    hash: String,
    #[serde(default)]
    allowed_sessions: u32,
}

#[derive(Debug, Deserialize)]
struct KeysDocument {
    #[serde(default)]
    users: Vec<UserEntry>,
}

/// Users loaded from `keys.json`.
#[derive(Debug, Default)]
pub struct KeyFile {
    users: HashMap<String, UserEntry>,
}

impl KeyFile {
    /// Load `<dir>/keys.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join("keys.json");
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let keys = Self::from_json(&raw)?;
        info!(path = %path.display(), user_count = keys.len(), "Portal keys loaded");
        Ok(keys)
    }

    /// Parse a `keys.json` document. Duplicate user names are rejected.
    pub fn from_json(raw: &str) -> Result<Self> {
        let document: KeysDocument = serde_json::from_str(raw)
            .map_err(|e| GatewayError::Config(format!("invalid keys file: {}", e)))?;

        let mut users = HashMap::with_capacity(document.users.len());
        for user in document.users {
            debug!(
                user = %user.name,
                allowed_sessions = user.allowed_sessions,
                "Portal user loaded"
            );
            if users.contains_key(&user.name) {
                return Err(GatewayError::Config(format!(
                    "duplicate user name '{}' in keys file",
                    user.name
                )));
            }
            users.insert(user.name.clone(), user);
        }
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for KeyFile {
    fn authenticate(&self, username: &str, key: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|user| verify_key(key, &user.hash))
    }
}

/// Hash a portal key for storage.
///
/// The key must satisfy the portal key pattern, otherwise it could never be
/// submitted through the login form.
pub fn hash_key(key: &str) -> Result<String> {
    hash_key_with_cost(key, DEFAULT_COST)
}

fn hash_key_with_cost(key: &str, cost: u32) -> Result<String> {
    if !validate_input(key, InputKind::Key) {
        return Err(GatewayError::Config(
            "invalid key format: use 12 to 64 letters, digits or ._:/?#@!$&'()*+,;=-".to_string(),
        ));
    }
    bcrypt::hash(key, cost)
        .map_err(|e| GatewayError::Config(format!("failed to hash key: {}", e)))
}

/// Check `key` against a stored bcrypt hash (`$2a$`, `$2b$`, `$2x$` or `$2y$`).
pub fn verify_key(key: &str, stored: &str) -> bool {
    match bcrypt::verify(key, stored) {
        Ok(matches) => matches,
        Err(e) => {
            debug!(error = %e, "Unusable key hash");
            false
        }
    }
}
