//! User model and login filters.
//!
//! A [`User`] is the group-resolved profile handed out by the
//! [`UserStore`](crate::store::UserStore). The SSH front-end snapshots it
//! at login time and keeps that snapshot for the whole connection.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Protocols a user account can be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Ssh,
    Ftp,
    Dav,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "SSH",
            Protocol::Ftp => "FTP",
            Protocol::Dav => "DAV",
            Protocol::Http => "HTTP",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Login methods tracked by the authentication state machine.
///
/// The two `PublicKeyAnd*` variants are the multi-step combinations: the
/// key succeeded with partial success and the second method completed the
/// login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
    #[serde(rename = "publickey+password")]
    PublicKeyAndPassword,
    #[serde(rename = "publickey+keyboard-interactive")]
    PublicKeyAndKeyboardInteractive,
    #[serde(rename = "no_auth_tried")]
    NoAuthTried,
}

impl LoginMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginMethod::Password => "password",
            LoginMethod::PublicKey => "publickey",
            LoginMethod::KeyboardInteractive => "keyboard-interactive",
            LoginMethod::PublicKeyAndPassword => "publickey+password",
            LoginMethod::PublicKeyAndKeyboardInteractive => "publickey+keyboard-interactive",
            LoginMethod::NoAuthTried => "no_auth_tried",
        }
    }

    /// True for the combinations that require a prior partial success.
    pub fn is_multi_step(&self) -> bool {
        matches!(
            self,
            LoginMethod::PublicKeyAndPassword | LoginMethod::PublicKeyAndKeyboardInteractive
        )
    }
}

impl std::fmt::Display for LoginMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single-step and multi-step methods a user filter can deny.
pub const VALID_LOGIN_METHODS: &[LoginMethod] = &[
    LoginMethod::PublicKey,
    LoginMethod::Password,
    LoginMethod::KeyboardInteractive,
    LoginMethod::PublicKeyAndPassword,
    LoginMethod::PublicKeyAndKeyboardInteractive,
];

/// Per-user restrictions, resolved against group settings by the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserFilters {
    /// Protocols the user must not log in with
    pub denied_protocols: Vec<Protocol>,
    /// Login methods the user must not use
    pub denied_login_methods: Vec<LoginMethod>,
    /// CIDR networks (or plain addresses) logins are allowed from.
    /// Empty means no restriction.
    pub allowed_ip: Vec<String>,
    /// CIDR networks (or plain addresses) logins are denied from
    pub denied_ip: Vec<String>,
    /// Protocols that require a configured second factor
    pub two_factor_protocols: Vec<Protocol>,
    /// Initial directory for SFTP sessions, relative to the virtual root
    pub start_directory: String,
}

/// A user account as seen by the protocol front-ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub username: String,
    /// Absolute path to the user's home directory on the backing storage
    pub home_dir: String,
    pub enabled: bool,
    /// Maximum concurrent sessions, 0 means unlimited
    pub max_sessions: u32,
    /// Whether a second factor has been configured for this account
    pub second_factor_configured: bool,
    pub filters: UserFilters,
    pub description: String,
}

impl User {
    /// Login methods not denied by the user's filter.
    pub fn allowed_login_methods(&self) -> Vec<LoginMethod> {
        VALID_LOGIN_METHODS
            .iter()
            .copied()
            .filter(|m| !self.filters.denied_login_methods.contains(m))
            .collect()
    }

    /// Whether `method` may complete the login, given the partial-success
    /// history of the connection.
    pub fn is_login_method_allowed(
        &self,
        method: LoginMethod,
        partial_success: &[LoginMethod],
    ) -> bool {
        if self.filters.denied_login_methods.is_empty() {
            return true;
        }
        if partial_success.len() == 1
            && self
                .next_auth_methods(partial_success, true)
                .contains(&method)
        {
            return true;
        }
        !self.filters.denied_login_methods.contains(&method)
    }

    /// The second-step methods still available after a partial success.
    ///
    /// Only a partially successful public key can be continued; any other
    /// history yields an empty list.
    pub fn next_auth_methods(
        &self,
        partial_success: &[LoginMethod],
        password_auth_enabled: bool,
    ) -> Vec<LoginMethod> {
        let mut methods = Vec::new();
        if partial_success.len() != 1 || partial_success[0] != LoginMethod::PublicKey {
            return methods;
        }
        for method in self.allowed_login_methods() {
            if method == LoginMethod::PublicKeyAndPassword && password_auth_enabled {
                methods.push(LoginMethod::Password);
            }
            if method == LoginMethod::PublicKeyAndKeyboardInteractive {
                methods.push(LoginMethod::KeyboardInteractive);
            }
        }
        methods
    }

    /// True when a successful `method` must be answered with partial
    /// success instead of completing the login: every login method the
    /// filter leaves available is a multi-step combination.
    pub fn is_partial_auth(&self, method: LoginMethod) -> bool {
        if method != LoginMethod::PublicKey {
            return false;
        }
        self.allowed_login_methods()
            .iter()
            .all(|m| m.is_multi_step())
    }

    pub fn is_protocol_denied(&self, protocol: Protocol) -> bool {
        self.filters.denied_protocols.contains(&protocol)
    }

    /// Whether the account still has to set up a second factor before it
    /// may use `protocol`.
    pub fn must_set_second_factor(&self, protocol: Protocol) -> bool {
        !self.second_factor_configured && self.filters.two_factor_protocols.contains(&protocol)
    }

    /// Evaluate the allow/deny address filters against a remote address.
    ///
    /// Deny entries win over allow entries; a non-empty allow list denies
    /// everything it does not match. Unparsable entries are skipped.
    pub fn is_login_from_addr_allowed(&self, remote: IpAddr) -> bool {
        if self.filters.allowed_ip.is_empty() && self.filters.denied_ip.is_empty() {
            return true;
        }
        if self.filters.denied_ip.iter().any(|n| net_contains(n, remote)) {
            return false;
        }
        if self.filters.allowed_ip.iter().any(|n| net_contains(n, remote)) {
            return true;
        }
        self.filters.allowed_ip.is_empty()
    }
}

fn net_contains(entry: &str, addr: IpAddr) -> bool {
    if let Ok(net) = entry.parse::<IpNet>() {
        return net.contains(&addr);
    }
    if let Ok(single) = entry.parse::<IpAddr>() {
        return single == addr;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_denied(denied: Vec<LoginMethod>) -> User {
        User {
            username: "alice".to_string(),
            home_dir: "/srv/data/alice".to_string(),
            enabled: true,
            filters: UserFilters {
                denied_login_methods: denied,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_login_method_allowed_without_filters() {
        let user = user_with_denied(Vec::new());
        for method in VALID_LOGIN_METHODS {
            assert!(user.is_login_method_allowed(*method, &[]));
        }
    }

    #[test]
    fn test_partial_auth_requires_multi_step_only() {
        // everything but the two-step combinations denied
        let user = user_with_denied(vec![
            LoginMethod::Password,
            LoginMethod::PublicKey,
            LoginMethod::KeyboardInteractive,
        ]);
        assert!(user.is_partial_auth(LoginMethod::PublicKey));
        assert!(!user.is_partial_auth(LoginMethod::Password));

        let relaxed = user_with_denied(vec![LoginMethod::Password]);
        assert!(!relaxed.is_partial_auth(LoginMethod::PublicKey));
    }

    #[test]
    fn test_next_auth_methods() {
        let user = user_with_denied(vec![
            LoginMethod::Password,
            LoginMethod::PublicKey,
            LoginMethod::KeyboardInteractive,
        ]);
        let partial = [LoginMethod::PublicKey];
        assert_eq!(
            user.next_auth_methods(&partial, true),
            vec![LoginMethod::Password, LoginMethod::KeyboardInteractive]
        );
        assert_eq!(
            user.next_auth_methods(&partial, false),
            vec![LoginMethod::KeyboardInteractive]
        );
        // only a partially successful public key can be continued
        assert!(user
            .next_auth_methods(&[LoginMethod::Password], true)
            .is_empty());
        assert!(user.next_auth_methods(&[], true).is_empty());
    }

    #[test]
    fn test_second_step_allowed_after_partial_success() {
        let user = user_with_denied(vec![
            LoginMethod::Password,
            LoginMethod::PublicKey,
            LoginMethod::KeyboardInteractive,
        ]);
        let partial = [LoginMethod::PublicKey];
        // plain password is denied, but it is acceptable as a second step
        assert!(!user.is_login_method_allowed(LoginMethod::Password, &[]));
        assert!(user.is_login_method_allowed(LoginMethod::Password, &partial));
    }

    #[test]
    fn test_addr_filters() {
        let mut user = user_with_denied(Vec::new());
        let lan: IpAddr = "192.168.1.5".parse().unwrap();
        let wan: IpAddr = "203.0.113.9".parse().unwrap();

        assert!(user.is_login_from_addr_allowed(lan));

        user.filters.allowed_ip = vec!["192.168.1.0/24".to_string()];
        assert!(user.is_login_from_addr_allowed(lan));
        assert!(!user.is_login_from_addr_allowed(wan));

        user.filters.denied_ip = vec!["192.168.1.5".to_string()];
        assert!(!user.is_login_from_addr_allowed(lan));
    }

    #[test]
    fn test_must_set_second_factor() {
        let mut user = user_with_denied(Vec::new());
        assert!(!user.must_set_second_factor(Protocol::Ssh));
        user.filters.two_factor_protocols = vec![Protocol::Ssh];
        assert!(user.must_set_second_factor(Protocol::Ssh));
        user.second_factor_configured = true;
        assert!(!user.must_set_second_factor(Protocol::Ssh));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let user = user_with_denied(vec![LoginMethod::Password]);
        let json = serde_json::to_string(&user).unwrap();
        let back: User = serde_json::from_str(&json).unwrap();
        assert_eq!(user, back);
    }
}
