//! Credential store interface.
//!
//! The daemon never reads credentials itself; every decision about who a
//! user is goes through a [`UserStore`]. The in-memory implementation is
//! the reference store used by tests and single-node deployments.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::user::{Protocol, User};

/// Store-backed user lookups and credential checks.
///
/// Implementations must return [`Error::NotFound`] for unknown users; the
/// authentication layer maps that onto a dedicated defender event.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Fetch a user profile with group settings resolved.
    async fn get_user(&self, username: &str) -> Result<User>;

    /// Validate a password login.
    async fn check_user_and_password(
        &self,
        username: &str,
        password: &str,
        remote: IpAddr,
        protocol: Protocol,
    ) -> Result<User>;

    /// Validate a public-key login. `offered_key` is the OpenSSH-encoded
    /// public key. When `cert_used` is set the key was vouched for by a
    /// trusted CA and is not required to appear in the user's key list.
    async fn check_user_and_pubkey(
        &self,
        username: &str,
        offered_key: &str,
        remote: IpAddr,
        protocol: Protocol,
        cert_used: bool,
    ) -> Result<User>;

    /// Record a successful login.
    async fn update_last_login(&self, username: &str);
}

/// A user record held by the in-memory store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoredUser {
    pub user: User,
    pub password: Option<String>,
    /// Authorized public keys in OpenSSH format
    pub public_keys: Vec<String>,
}

#[derive(Default)]
struct MemoryStoreInner {
    users: HashMap<String, StoredUser>,
    last_logins: HashMap<String, DateTime<Utc>>,
}

/// In-memory [`UserStore`].
#[derive(Default)]
pub struct MemoryUserStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, stored: StoredUser) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.users.insert(stored.user.username.clone(), stored);
    }

    pub fn remove_user(&self, username: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.users.remove(username);
        inner.last_logins.remove(username);
    }

    pub fn last_login(&self, username: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.last_logins.get(username).copied()
    }

    fn lookup(&self, username: &str) -> Result<StoredUser> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let stored = inner
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("username {username:?}")))?;
        if !stored.user.enabled {
            return Err(Error::InvalidCredentials(format!(
                "user {username:?} is disabled"
            )));
        }
        Ok(stored)
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_user(&self, username: &str) -> Result<User> {
        Ok(self.lookup(username)?.user)
    }

    async fn check_user_and_password(
        &self,
        username: &str,
        password: &str,
        remote: IpAddr,
        protocol: Protocol,
    ) -> Result<User> {
        let stored = self.lookup(username)?;
        match stored.password.as_deref() {
            Some(expected) if expected == password => {
                debug!(username, %remote, %protocol, "password verified");
                Ok(stored.user)
            }
            _ => Err(Error::InvalidCredentials(format!(
                "password mismatch for user {username:?}"
            ))),
        }
    }

    async fn check_user_and_pubkey(
        &self,
        username: &str,
        offered_key: &str,
        remote: IpAddr,
        protocol: Protocol,
        cert_used: bool,
    ) -> Result<User> {
        let stored = self.lookup(username)?;
        if cert_used {
            // a trusted CA vouched for the key, the profile is enough
            return Ok(stored.user);
        }
        let offered = key_blob(offered_key)
            .ok_or_else(|| Error::Validation("malformed public key offered".to_string()))?;
        let matched = stored
            .public_keys
            .iter()
            .any(|line| key_blob(line) == Some(offered));
        if matched {
            debug!(username, %remote, %protocol, "public key matched");
            Ok(stored.user)
        } else {
            Err(Error::InvalidCredentials(format!(
                "public key not authorized for user {username:?}"
            )))
        }
    }

    async fn update_last_login(&self, username: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.last_logins.insert(username.to_string(), Utc::now());
        info!(username, "last login updated");
    }
}

/// Extract the `<algo> <base64>` part of an OpenSSH public key line,
/// ignoring the optional comment.
fn key_blob(line: &str) -> Option<(&str, &str)> {
    let mut fields = line.split_whitespace();
    Some((fields.next()?, fields.next()?))
}
