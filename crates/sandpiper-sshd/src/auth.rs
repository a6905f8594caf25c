//! Authentication state machine support.
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-7 (Unsuccessful Logon Attempts)
//! STIG: V-222578 - Implement replay-resistant authentication mechanisms
//! Implementation: Shared authentication state, final login checks and failure bookkeeping
//!
//! The transport invokes one callback per attempt; everything the
//! attempts share lives here: the partial-success state, the final login
//! check common to all success paths, and the failure bookkeeping
//! (metrics, logs, defender events).

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use sandpiper_core::{Defender, HostEvent, LoginMethod, Protocol, User};
use tracing::{info, warn};

use crate::certs::CertAuthInfo;
use crate::connection::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Authentication progress of one connection.
///
/// NIST 800-53: IA-2 (Identification and Authentication)
/// STIG: V-222578 - Replay-resistant authentication
/// Implementation: Tracks partial-success methods for multi-factor logins
///
/// `Init` is the empty partial set; a partially successful public key
/// moves the state to `Partial`; the transport decides `Rejected` and
/// `Disconnected` by itself.
#[derive(Debug, Default)]
pub struct AuthState {
    pub partial_success: Vec<LoginMethod>,
    pub attempts: u32,
}

impl AuthState {
    /// The method a second-step attempt is accounted under: after a
    /// partially successful public key, `password` becomes
    /// `publickey+password` and `keyboard-interactive` becomes
    /// `publickey+keyboard-interactive`.
    pub fn effective_method(&self, base: LoginMethod) -> LoginMethod {
        if self.partial_success == [LoginMethod::PublicKey] {
            match base {
                LoginMethod::Password => LoginMethod::PublicKeyAndPassword,
                LoginMethod::KeyboardInteractive => LoginMethod::PublicKeyAndKeyboardInteractive,
                other => other,
            }
        } else {
            base
        }
    }

    pub fn record_partial_success(&mut self, method: LoginMethod) {
        if !self.partial_success.contains(&method) {
            self.partial_success.push(method);
        }
    }
}

/// The snapshot produced by a successful login. It never changes for
/// the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub method: LoginMethod,
    /// Method plus credential description, e.g.
    /// `publickey: SHA256:... alice@host`
    pub method_description: String,
    /// JSON snapshot of the user profile taken at the login decision
    pub user_json: String,
    pub cert: Option<CertAuthInfo>,
}

/// The final login check common to all success paths, performed in
/// order; the first failure rejects the login.
///
/// # NIST 800-53: AC-3 (Access Enforcement), AC-10 (Concurrent Session Control), IA-2
/// # STIG: V-222596 - Authorization enforcement, V-222601 - Concurrent session control
/// # Implementation: Home dir, protocol, session, method, second-factor and address checks
pub fn finalize_login(
    registry: &ConnectionRegistry,
    connection_id: &str,
    user: User,
    method: LoginMethod,
    key_description: Option<String>,
    remote: IpAddr,
    partial_success: &[LoginMethod],
    cert: Option<CertAuthInfo>,
) -> Result<LoginOutcome> {
    if !std::path::Path::new(&user.home_dir).is_absolute() {
        warn!(
            connection_id,
            username = %user.username,
            home_dir = %user.home_dir,
            "login denied, home dir must be an absolute path"
        );
        return Err(Error::Other(format!(
            "user {:?} has an invalid home dir {:?}",
            user.username, user.home_dir
        )));
    }
    if user.is_protocol_denied(Protocol::Ssh) {
        info!(connection_id, username = %user.username, "login denied, SSH protocol not allowed");
        return Err(Error::Other(format!(
            "protocol SSH is not allowed for user {:?}",
            user.username
        )));
    }
    if user.max_sessions > 0 {
        let active = registry.active_sessions(&user.username);
        if active >= user.max_sessions as usize {
            info!(
                connection_id,
                username = %user.username,
                active,
                max_sessions = user.max_sessions,
                "login denied, too many open sessions"
            );
            return Err(Error::Other(format!("too many open sessions: {active}")));
        }
    }
    if !user.is_login_method_allowed(method, partial_success) {
        info!(
            connection_id,
            username = %user.username,
            method = %method,
            "login denied, method not allowed"
        );
        return Err(Error::Other(format!(
            "login method {method} is not allowed for user {:?}",
            user.username
        )));
    }
    if user.must_set_second_factor(Protocol::Ssh) {
        info!(
            connection_id,
            username = %user.username,
            "login denied, second factor authentication is not set"
        );
        return Err(Error::Other(format!(
            "second factor authentication is not set for user {:?}",
            user.username
        )));
    }
    if !user.is_login_from_addr_allowed(remote) {
        info!(
            connection_id,
            username = %user.username,
            %remote,
            "login denied, remote address not allowed"
        );
        return Err(Error::Other(format!(
            "login for user {:?} is not allowed from {remote}",
            user.username
        )));
    }

    let user_json = serde_json::to_string(&user)
        .map_err(|e| Error::Other(format!("error serializing user info: {e}")))?;
    let method_description = match key_description {
        Some(description) => format!("{method}: {description}"),
        None => method.to_string(),
    };
    Ok(LoginOutcome {
        user,
        method,
        method_description,
        user_json,
        cert,
    })
}

/// Per-attempt bookkeeping: counters always, logs on failure, defender
/// events on failure except for single public-key attempts (clients
/// probe many keys; those are reported once per connection when the
/// whole handshake fails).
///
/// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts), AU-2 (Audit Events)
/// # STIG: V-222578
/// # Implementation: Counts every attempt and feeds failures to the defender
pub fn record_login_attempt(
    metrics: &Metrics,
    defender: &dyn Defender,
    username: &str,
    ip: IpAddr,
    method: LoginMethod,
    error: Option<&Error>,
) {
    metrics.add_login_attempt(method);
    if let Some(error) = error {
        warn!(
            username,
            %ip,
            method = %method,
            error = %error,
            "authentication failed"
        );
        if method != LoginMethod::PublicKey {
            let event = if error.is_not_found() {
                HostEvent::UserNotFound
            } else {
                HostEvent::LoginFailed
            };
            defender.add_event(ip, Protocol::Ssh, event);
        }
    }
    metrics.add_login_result(method, error.is_none());
}

/// Shared flags tracking how a connection's authentication went; used
/// once the transport gives up to emit the per-connection events.
///
/// NIST 800-53: AC-7 (Unsuccessful Logon Attempts), AU-2 (Audit Events)
/// Implementation: Defers public-key failure reporting to once per connection
#[derive(Debug, Default)]
pub struct AuthActivity {
    inner: Mutex<AuthActivityInner>,
}

#[derive(Debug, Default)]
struct AuthActivityInner {
    authenticated: bool,
    attempted: bool,
    pubkey_failed: bool,
    pubkey_user_not_found: bool,
}

impl AuthActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn note_attempt(&self) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).attempted = true;
    }

    pub fn note_authenticated(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.authenticated = true;
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .authenticated
    }

    pub fn note_pubkey_failure(&self, user_not_found: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pubkey_failed = true;
        inner.pubkey_user_not_found |= user_not_found;
    }

    /// Emit the once-per-connection defender events after the handshake
    /// failed: one event for all public-key failures, or the
    /// no-login-tried bookkeeping when no method was ever attempted.
    ///
    /// # NIST 800-53: AC-7 (Unsuccessful Logon Attempts), AU-2 (Audit Events)
    /// # Implementation: One defender event per failed connection, not per probed key
    pub fn flush_failure(&self, metrics: &Metrics, defender: &dyn Defender, ip: IpAddr) {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.authenticated {
            return;
        }
        if inner.pubkey_failed {
            let event = if inner.pubkey_user_not_found {
                HostEvent::UserNotFound
            } else {
                HostEvent::LoginFailed
            };
            defender.add_event(ip, Protocol::Ssh, event);
            return;
        }
        if !inner.attempted {
            warn!(%ip, "connection closed without authentication attempts");
            metrics.add_no_auth_tried();
            defender.add_event(ip, Protocol::Ssh, HostEvent::NoLoginTried);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnProtocol, SessionInfo};
    use sandpiper_core::{MemoryDefender, MemoryDefenderConfig, UserFilters};

    fn remote() -> IpAddr {
        "203.0.113.7".parse().unwrap()
    }

    fn valid_user() -> User {
        User {
            username: "alice".to_string(),
            home_dir: "/srv/data/alice".to_string(),
            enabled: true,
            ..Default::default()
        }
    }

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(0, 0))
    }

    fn finalize(user: User, registry: &ConnectionRegistry) -> Result<LoginOutcome> {
        finalize_login(
            registry,
            "conn1",
            user,
            LoginMethod::Password,
            None,
            remote(),
            &[],
            None,
        )
    }

    #[test]
    fn test_effective_method() {
        let mut state = AuthState::default();
        assert_eq!(
            state.effective_method(LoginMethod::Password),
            LoginMethod::Password
        );
        state.record_partial_success(LoginMethod::PublicKey);
        assert_eq!(
            state.effective_method(LoginMethod::Password),
            LoginMethod::PublicKeyAndPassword
        );
        assert_eq!(
            state.effective_method(LoginMethod::KeyboardInteractive),
            LoginMethod::PublicKeyAndKeyboardInteractive
        );
        // recording twice keeps the set deduplicated
        state.record_partial_success(LoginMethod::PublicKey);
        assert_eq!(state.partial_success, vec![LoginMethod::PublicKey]);
    }

    #[test]
    fn test_finalize_login_success_round_trips_snapshot() {
        let registry = registry();
        let outcome = finalize(valid_user(), &registry).unwrap();
        assert_eq!(outcome.method_description, "password");
        let back: User = serde_json::from_str(&outcome.user_json).unwrap();
        assert_eq!(back, outcome.user);
    }

    #[test]
    fn test_finalize_login_relative_home_rejected() {
        let registry = registry();
        let mut user = valid_user();
        user.home_dir = "data/alice".to_string();
        assert!(finalize(user, &registry).is_err());
    }

    #[test]
    fn test_finalize_login_denied_protocol() {
        let registry = registry();
        let mut user = valid_user();
        user.filters.denied_protocols = vec![Protocol::Ssh];
        assert!(finalize(user, &registry).is_err());
    }

    #[test]
    fn test_finalize_login_max_sessions() {
        let registry = registry();
        let mut user = valid_user();
        user.max_sessions = 1;

        let _guard = registry.add_session(SessionInfo {
            id: "other_1".to_string(),
            username: "alice".to_string(),
            protocol: ConnProtocol::Sftp,
            remote_ip: remote(),
            connected_at: chrono::Utc::now(),
        });
        let err = finalize(user.clone(), &registry).unwrap_err();
        assert!(err.to_string().contains("too many open sessions"));

        // 0 means unlimited
        user.max_sessions = 0;
        assert!(finalize(user, &registry).is_ok());
    }

    #[test]
    fn test_finalize_login_method_filter_considers_partial_history() {
        let registry = registry();
        let mut user = valid_user();
        user.filters = UserFilters {
            denied_login_methods: vec![
                LoginMethod::Password,
                LoginMethod::PublicKey,
                LoginMethod::KeyboardInteractive,
            ],
            ..Default::default()
        };

        // plain password login is denied
        assert!(finalize(user.clone(), &registry).is_err());

        // but it is fine as the second step after a public key
        let outcome = finalize_login(
            &registry,
            "conn1",
            user,
            LoginMethod::Password,
            None,
            remote(),
            &[LoginMethod::PublicKey],
            None,
        );
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_finalize_login_second_factor_required() {
        let registry = registry();
        let mut user = valid_user();
        user.filters.two_factor_protocols = vec![Protocol::Ssh];
        assert!(finalize(user.clone(), &registry).is_err());
        user.second_factor_configured = true;
        assert!(finalize(user, &registry).is_ok());
    }

    #[test]
    fn test_finalize_login_address_filter() {
        let registry = registry();
        let mut user = valid_user();
        user.filters.denied_ip = vec!["203.0.113.0/24".to_string()];
        assert!(finalize(user, &registry).is_err());
    }

    #[test]
    fn test_finalize_login_key_description() {
        let registry = registry();
        let outcome = finalize_login(
            &registry,
            "conn1",
            valid_user(),
            LoginMethod::PublicKey,
            Some("SHA256:abcd alice@host".to_string()),
            remote(),
            &[],
            None,
        )
        .unwrap();
        assert_eq!(
            outcome.method_description,
            "publickey: SHA256:abcd alice@host"
        );
    }

    #[test]
    fn test_record_login_attempt_defender_events() {
        let metrics = Metrics::new();
        let defender = MemoryDefender::new(MemoryDefenderConfig {
            score_threshold: 1000,
            ..Default::default()
        });
        let err = Error::Other("bad password".to_string());

        record_login_attempt(
            &metrics,
            &defender,
            "alice",
            remote(),
            LoginMethod::Password,
            Some(&err),
        );
        assert_eq!(defender.score(remote()), HostEvent::LoginFailed.score());

        // public key failures are not reported per attempt
        record_login_attempt(
            &metrics,
            &defender,
            "alice",
            remote(),
            LoginMethod::PublicKey,
            Some(&err),
        );
        assert_eq!(defender.score(remote()), HostEvent::LoginFailed.score());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.password.failed, 1);
        assert_eq!(snapshot.public_key.failed, 1);
    }

    #[test]
    fn test_record_login_attempt_not_found() {
        let metrics = Metrics::new();
        let defender = MemoryDefender::new(MemoryDefenderConfig {
            score_threshold: 1000,
            ..Default::default()
        });
        let err = Error::auth(
            LoginMethod::Password,
            Error::Core(sandpiper_core::Error::NotFound("alice".to_string())),
        );
        record_login_attempt(
            &metrics,
            &defender,
            "alice",
            remote(),
            LoginMethod::Password,
            Some(&err),
        );
        assert_eq!(defender.score(remote()), HostEvent::UserNotFound.score());
    }

    #[test]
    fn test_auth_activity_flush() {
        let metrics = Metrics::new();
        let defender = MemoryDefender::new(MemoryDefenderConfig {
            score_threshold: 1000,
            ..Default::default()
        });

        // one event for all the probed keys
        let activity = AuthActivity::new();
        activity.note_attempt();
        activity.note_pubkey_failure(false);
        activity.note_pubkey_failure(true);
        activity.flush_failure(&metrics, &defender, remote());
        assert_eq!(defender.score(remote()), HostEvent::UserNotFound.score());

        // nothing tried at all
        let silent: IpAddr = "203.0.113.8".parse().unwrap();
        let activity = AuthActivity::new();
        activity.flush_failure(&metrics, &defender, silent);
        assert_eq!(defender.score(silent), HostEvent::NoLoginTried.score());
        assert_eq!(metrics.snapshot().no_auth_tried, 1);

        // a successful connection emits nothing
        let quiet: IpAddr = "203.0.113.9".parse().unwrap();
        let activity = AuthActivity::new();
        activity.note_attempt();
        activity.note_authenticated();
        activity.flush_failure(&metrics, &defender, quiet);
        assert_eq!(defender.score(quiet), 0);
    }
}
