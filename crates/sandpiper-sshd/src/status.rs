//! Observable service status.
//!
//! The snapshot is built once at initialize and is read lock-free
//! afterwards.

use sandpiper_core::LoginMethod;
use serde::Serialize;

use crate::config::Binding;

#[derive(Debug, Clone, Serialize)]
pub struct HostKeyInfo {
    pub path: String,
    pub fingerprint: String,
    pub algorithm: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatus {
    pub is_active: bool,
    pub bindings: Vec<Binding>,
    pub host_keys: Vec<HostKeyInfo>,
    pub ssh_commands: Vec<String>,
    /// Enabled authentication methods, including the derived multi-step
    /// combinations
    pub authentications: Vec<String>,
    pub host_key_algos: Vec<String>,
    pub kex_algorithms: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
}

/// Derive the advertised authentication list from the enabled methods.
///
/// Public key is always available; the multi-step combinations appear
/// when both of their halves do.
pub fn derive_authentications(
    password_enabled: bool,
    keyboard_interactive_enabled: bool,
) -> Vec<String> {
    let mut methods = Vec::new();
    if password_enabled {
        methods.push(LoginMethod::Password.to_string());
    }
    methods.push(LoginMethod::PublicKey.to_string());
    if keyboard_interactive_enabled {
        methods.push(LoginMethod::KeyboardInteractive.to_string());
    }
    if password_enabled {
        methods.push(LoginMethod::PublicKeyAndPassword.to_string());
    }
    if keyboard_interactive_enabled {
        methods.push(LoginMethod::PublicKeyAndKeyboardInteractive.to_string());
    }
    methods
}
