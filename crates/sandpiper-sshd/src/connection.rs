//! Global connection table.
//!
//! Two levels are tracked: client connections (one per TCP connection,
//! counted per source address and globally, capped at admission) and
//! sessions (one per accepted session channel, carrying the
//! authenticated user). Client registration hands out a guard so
//! deregistration happens on every exit path.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Protocol attributed to a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnProtocol {
    #[serde(rename = "SFTP")]
    Sftp,
    #[serde(rename = "sshd_exec")]
    SshExec,
}

impl ConnProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnProtocol::Sftp => "SFTP",
            ConnProtocol::SshExec => "sshd_exec",
        }
    }
}

impl std::fmt::Display for ConnProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active session channel.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub username: String,
    pub protocol: ConnProtocol,
    pub remote_ip: IpAddr,
    pub connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    clients: HashMap<IpAddr, usize>,
    total_clients: usize,
    sessions: HashMap<String, SessionInfo>,
}

/// Connection table shared by all listeners of one server.
pub struct ConnectionRegistry {
    /// 0 means unlimited
    max_total: usize,
    /// 0 means unlimited
    max_per_host: usize,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(max_total: usize, max_per_host: usize) -> Self {
        Self {
            max_total,
            max_per_host,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a client connection, enforcing both concurrency caps.
    pub fn add_client(self: &Arc<Self>, ip: IpAddr) -> Result<ClientGuard> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.max_total > 0 && inner.total_clients >= self.max_total {
            warn!(%ip, total = inner.total_clients, "global connection limit reached");
            return Err(Error::Admission(format!(
                "maximum number of connections reached: {}",
                inner.total_clients
            )));
        }
        let per_host = inner.clients.get(&ip).copied().unwrap_or(0);
        if self.max_per_host > 0 && per_host >= self.max_per_host {
            warn!(%ip, per_host, "per-host connection limit reached");
            return Err(Error::Admission(format!(
                "maximum number of connections from {ip} reached: {per_host}"
            )));
        }
        *inner.clients.entry(ip).or_insert(0) += 1;
        inner.total_clients += 1;
        debug!(%ip, total = inner.total_clients, "client connection added");
        Ok(ClientGuard {
            registry: Arc::clone(self),
            ip,
        })
    }

    fn remove_client(&self, ip: IpAddr) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = inner.clients.get_mut(&ip) {
            *count -= 1;
            if *count == 0 {
                inner.clients.remove(&ip);
            }
        }
        inner.total_clients = inner.total_clients.saturating_sub(1);
        debug!(%ip, total = inner.total_clients, "client connection removed");
    }

    /// Register an authenticated session channel.
    pub fn add_session(self: &Arc<Self>, info: SessionInfo) -> SessionGuard {
        let id = info.id.clone();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug!(
            id = %info.id,
            username = %info.username,
            protocol = %info.protocol,
            "session added"
        );
        inner.sessions.insert(id.clone(), info);
        SessionGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    fn remove_session(&self, id: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.sessions.remove(id).is_some() {
            debug!(id, "session removed");
        }
    }

    /// Number of active sessions for a user. The `max_sessions` check is
    /// advisory: check-then-add, a small race is tolerated.
    pub fn active_sessions(&self, username: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .sessions
            .values()
            .filter(|s| s.username == username)
            .count()
    }

    pub fn client_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total_clients
    }

    pub fn client_count_for(&self, ip: IpAddr) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clients.get(&ip).copied().unwrap_or(0)
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sessions.values().cloned().collect()
    }
}

/// Removes the client connection when dropped.
pub struct ClientGuard {
    registry: Arc<ConnectionRegistry>,
    ip: IpAddr,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.registry.remove_client(self.ip);
    }
}

/// Removes the session when dropped.
pub struct SessionGuard {
    registry: Arc<ConnectionRegistry>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.remove_session(&self.id);
    }
}
