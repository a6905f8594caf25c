//! Login and connection counters.
//!
//! Thread-safe counters using atomics; a snapshot is serializable for
//! export. Every authentication attempt is recorded with its login
//! method, successful or not.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use sandpiper_core::LoginMethod;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct MethodCounters {
    attempts: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
}

impl MethodCounters {
    fn snapshot(&self) -> MethodSnapshot {
        MethodSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    password: MethodCounters,
    public_key: MethodCounters,
    keyboard_interactive: MethodCounters,
    key_and_password: MethodCounters,
    key_and_keyboard_interactive: MethodCounters,
    no_auth_tried: AtomicU64,
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    rejected_connections: AtomicU64,
}

/// Server-wide metrics collection.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MethodSnapshot {
    pub attempts: u64,
    pub ok: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub password: MethodSnapshot,
    pub public_key: MethodSnapshot,
    pub keyboard_interactive: MethodSnapshot,
    pub key_and_password: MethodSnapshot,
    pub key_and_keyboard_interactive: MethodSnapshot,
    pub no_auth_tried: u64,
    pub total_connections: u64,
    pub active_connections: usize,
    pub rejected_connections: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, method: LoginMethod) -> Option<&MethodCounters> {
        match method {
            LoginMethod::Password => Some(&self.inner.password),
            LoginMethod::PublicKey => Some(&self.inner.public_key),
            LoginMethod::KeyboardInteractive => Some(&self.inner.keyboard_interactive),
            LoginMethod::PublicKeyAndPassword => Some(&self.inner.key_and_password),
            LoginMethod::PublicKeyAndKeyboardInteractive => {
                Some(&self.inner.key_and_keyboard_interactive)
            }
            LoginMethod::NoAuthTried => None,
        }
    }

    /// Record that an authentication attempt started.
    pub fn add_login_attempt(&self, method: LoginMethod) {
        if let Some(counters) = self.counters(method) {
            counters.attempts.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record the outcome of an authentication attempt.
    pub fn add_login_result(&self, method: LoginMethod, success: bool) {
        if let Some(counters) = self.counters(method) {
            if success {
                counters.ok.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a connection that failed the handshake without attempting
    /// any authentication method.
    pub fn add_no_auth_tried(&self) {
        self.inner.no_auth_tried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);
        self.inner.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.inner.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_rejected(&self) {
        self.inner
            .rejected_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            password: self.inner.password.snapshot(),
            public_key: self.inner.public_key.snapshot(),
            keyboard_interactive: self.inner.keyboard_interactive.snapshot(),
            key_and_password: self.inner.key_and_password.snapshot(),
            key_and_keyboard_interactive: self.inner.key_and_keyboard_interactive.snapshot(),
            no_auth_tried: self.inner.no_auth_tried.load(Ordering::Relaxed),
            total_connections: self.inner.total_connections.load(Ordering::Relaxed),
            active_connections: self.inner.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.inner.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_counters_by_method() {
        let metrics = Metrics::new();
        metrics.add_login_attempt(LoginMethod::Password);
        metrics.add_login_result(LoginMethod::Password, false);
        metrics.add_login_attempt(LoginMethod::PublicKey);
        metrics.add_login_result(LoginMethod::PublicKey, true);
        metrics.add_login_attempt(LoginMethod::PublicKeyAndPassword);
        metrics.add_login_result(LoginMethod::PublicKeyAndPassword, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.password.attempts, 1);
        assert_eq!(snapshot.password.failed, 1);
        assert_eq!(snapshot.public_key.ok, 1);
        assert_eq!(snapshot.key_and_password.ok, 1);
        assert_eq!(snapshot.keyboard_interactive.attempts, 0);
    }

    #[test]
    fn test_connection_counters() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.connection_closed();
        metrics.connection_rejected();
        metrics.add_no_auth_tried();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.active_connections, 1);
        assert_eq!(snapshot.rejected_connections, 1);
        assert_eq!(snapshot.no_auth_tried, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = Metrics::new();
        metrics.add_login_attempt(LoginMethod::KeyboardInteractive);
        let json = serde_json::to_string(&metrics.snapshot()).unwrap();
        assert!(json.contains("keyboard_interactive"));
    }
}
