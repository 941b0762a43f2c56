//! Authentication Module
//!
//! Username/password authentication backed by argon2 password hashes.

use std::collections::HashMap;
use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordVerifier};
use argon2::Argon2;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::config::AuthConfig;
use crate::hooks::{HookResult, Hooks};


/// Authentication provider
pub struct AuthProvider {
    /// Whether auth is enabled
    enabled: bool,
    /// Allow anonymous connections
    allow_anonymous: bool,
    /// User credentials map (username -> PHC-formatted argon2 hash)
    users: HashMap<String, String>,
    /// Connected client usernames (for ACL lookups)
    client_usernames: Arc<RwLock<HashMap<String, Option<String>>>>,
}

impl AuthProvider {
    /// Create a new auth provider from configuration
    pub fn new(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|user| (user.username.clone(), user.password_hash.clone()))
            .collect();

        Self {
            enabled: config.enabled,
            allow_anonymous: config.allow_anonymous,
            users,
            client_usernames: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Check if auth is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Get the username for a connected client
    pub fn get_client_username(&self, client_id: &str) -> Option<String> {
        self.client_usernames
            .read()
            .get(client_id)
            .and_then(|u| u.clone())
    }

    /// Verify a password against a stored argon2 PHC hash.
    fn verify_password(&self, password: &[u8], stored_hash: &str) -> bool {
        let parsed = match PasswordHash::new(stored_hash) {
            Ok(h) => h,
            Err(e) => {
                warn!("malformed password hash: {}", e);
                return false;
            }
        };
        Argon2::default().verify_password(password, &parsed).is_ok()
    }

    /// Store client username mapping
    fn store_client_username(&self, client_id: &str, username: Option<&str>) {
        self.client_usernames
            .write()
            .insert(client_id.to_string(), username.map(|s| s.to_string()));
    }

    /// Remove client username mapping
    pub fn remove_client_username(&self, client_id: &str) {
        self.client_usernames.write().remove(client_id);
    }
}

#[async_trait]
impl Hooks for AuthProvider {
    async fn on_authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> HookResult<bool> {
        // If auth is disabled, allow all
        if !self.enabled {
            self.store_client_username(client_id, username);
            return Ok(true);
        }

        // Check for anonymous connection
        if username.is_none() {
            if self.allow_anonymous {
                self.store_client_username(client_id, None);
                return Ok(true);
            } else {
                return Ok(false);
            }
        }

        let username = username.unwrap();
        let password = password.unwrap_or(&[]);

        let stored_hash = match self.users.get(username) {
            Some(h) => h,
            None => return Ok(false),
        };

        if self.verify_password(password, stored_hash) {
            self.store_client_username(client_id, Some(username));
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn on_client_disconnected(&self, client_id: &str, _graceful: bool) {
        self.remove_client_username(client_id);
    }
}
