//! Configuration for the SSH front-end.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// A network listener definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Binding {
    /// Address to listen on. Blank means all interfaces.
    pub address: String,
    /// Port used for serving requests. A binding with port 0 is ignored.
    pub port: u16,
    /// Expect a proxy-protocol header on connections to this binding
    pub apply_proxy_config: bool,
}

impl Default for Binding {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 2022,
            apply_proxy_config: false,
        }
    }
}

impl Binding {
    /// The `address:port` string used for binding the listener.
    pub fn socket_address(&self) -> String {
        let address = if self.address.is_empty() {
            "0.0.0.0"
        } else {
            &self.address
        };
        format!("{}:{}", address, self.port)
    }

    pub fn is_valid(&self) -> bool {
        self.port > 0
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

/// Logging configuration for the server binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
    /// Optional log file path (logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            file: None,
        }
    }
}

/// Per-source connection rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Connections allowed per source within the window. 0 disables
    /// rate limiting.
    pub max_per_window: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_window: 0,
            window_secs: 60,
        }
    }
}

/// SSH front-end configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Identification string appended to `SSH-2.0-`
    #[serde(default = "default_banner")]
    pub banner: String,

    /// Addresses and ports to bind to
    #[serde(default = "default_bindings")]
    pub bindings: Vec<Binding>,

    /// Maximum authentication attempts per connection.
    /// Negative means unlimited, zero means 6.
    #[serde(default)]
    pub max_auth_tries: i32,

    /// Private host keys, absolute or relative to the configuration
    /// directory. If empty, default RSA/ECDSA/Ed25519 keys are searched
    /// for or generated inside the configuration directory.
    #[serde(default)]
    pub host_keys: Vec<String>,

    /// Public host certificates. A certificate whose public key matches
    /// no loaded private key is silently ignored.
    #[serde(default)]
    pub host_certificates: Vec<String>,

    /// Host key algorithms accepted by the server, in preference order
    #[serde(default)]
    pub host_key_algorithms: Vec<String>,

    /// Diffie-Hellman moduli files. At least one valid file enables the
    /// DH group-exchange KEX algorithms.
    #[serde(default)]
    pub moduli: Vec<String>,

    /// KEX algorithms in preference order
    #[serde(default)]
    pub kex_algorithms: Vec<String>,

    /// Allowed ciphers in preference order
    #[serde(default)]
    pub ciphers: Vec<String>,

    /// Allowed MAC algorithms in preference order
    #[serde(default)]
    pub macs: Vec<String>,

    /// Public key files of CAs trusted to sign user certificates
    #[serde(default)]
    pub trusted_user_ca_keys: Vec<String>,

    /// JSON file with the fingerprints of revoked user certificates
    #[serde(default)]
    pub revoked_user_certs_file: String,

    /// File whose contents are sent to the client before authentication
    #[serde(default)]
    pub login_banner_file: String,

    /// Enabled SSH commands. `*` enables all supported commands.
    #[serde(default = "default_enabled_ssh_commands")]
    pub enabled_ssh_commands: Vec<String>,

    /// Whether keyboard-interactive authentication is allowed
    #[serde(default)]
    pub keyboard_interactive_authentication: bool,

    /// Absolute path to an external program, or an http(s) URL, driving
    /// the keyboard-interactive prompts. Invalid values disable the hook.
    #[serde(default)]
    pub keyboard_interactive_auth_hook: String,

    /// Whether password authentication is allowed
    #[serde(default = "default_password_authentication")]
    pub password_authentication: bool,

    /// Virtual root folder prefix prepended to every SFTP path
    /// (for example `/files`). Configuring a prefix disables the SSH
    /// exec commands.
    #[serde(default)]
    pub folder_prefix: String,

    /// Optional strftime layout; when set, uploads through the prefix
    /// middleware get the formatted date inserted before the file name
    /// (for example `%Y/%m/%d`)
    #[serde(default)]
    pub folder_prefix_date_layout: String,

    /// External program or http(s) URL invoked for every new connection;
    /// a failure closes the connection
    #[serde(default)]
    pub post_connect_hook: String,

    /// Deadline for completing the SSH handshake, in seconds
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Per-session inactivity timeout, in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Total concurrent client connections. 0 means unlimited.
    #[serde(default)]
    pub max_total_connections: usize,

    /// Concurrent client connections per source address. 0 means
    /// unlimited.
    #[serde(default = "default_max_per_host_connections")]
    pub max_per_host_connections: usize,

    /// Per-source connection rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Logging configuration used by the server binary
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            banner: default_banner(),
            bindings: default_bindings(),
            max_auth_tries: 0,
            host_keys: Vec::new(),
            host_certificates: Vec::new(),
            host_key_algorithms: Vec::new(),
            moduli: Vec::new(),
            kex_algorithms: Vec::new(),
            ciphers: Vec::new(),
            macs: Vec::new(),
            trusted_user_ca_keys: Vec::new(),
            revoked_user_certs_file: String::new(),
            login_banner_file: String::new(),
            enabled_ssh_commands: default_enabled_ssh_commands(),
            keyboard_interactive_authentication: false,
            keyboard_interactive_auth_hook: String::new(),
            password_authentication: default_password_authentication(),
            folder_prefix: String::new(),
            folder_prefix_date_layout: String::new(),
            post_connect_hook: String::new(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_total_connections: 0,
            max_per_host_connections: default_max_per_host_connections(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_banner() -> String {
    format!("Sandpiper_{}", env!("CARGO_PKG_VERSION"))
}

fn default_bindings() -> Vec<Binding> {
    vec![Binding::default()]
}

fn default_enabled_ssh_commands() -> Vec<String> {
    crate::commands::default_ssh_commands()
}

fn default_password_authentication() -> bool {
    true
}

// NIST 800-53: AC-12 (Session Termination)
// Default: 2 minute handshake deadline, as OpenSSH
fn default_handshake_timeout_secs() -> u64 {
    120
}

// NIST 800-53: AC-12 (Session Termination)
// Default: 5 minute inactivity timeout
fn default_idle_timeout_secs() -> u64 {
    300
}

// NIST 800-53: AC-10 (Concurrent Session Control)
// Default: 20 connections per source address
fn default_max_per_host_connections() -> usize {
    20
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))
    }

    /// True if there is at least one valid binding.
    pub fn should_bind(&self) -> bool {
        self.bindings.iter().any(Binding::is_valid)
    }

    /// The attempt limit actually applied to the transport:
    /// negative means unlimited, zero maps to 6.
    pub fn effective_max_auth_tries(&self) -> usize {
        match self.max_auth_tries {
            n if n < 0 => usize::MAX,
            0 => 6,
            n => n as usize,
        }
    }

    pub fn handshake_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.idle_timeout_secs)
    }

    /// The SSH identification string sent to clients.
    pub fn server_id(&self) -> String {
        format!("SSH-2.0-{}", self.banner)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handshake_timeout_secs == 0 {
            return Err(Error::Config(
                "handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.banner.chars().any(|c| c.is_whitespace()) {
            return Err(Error::Config(
                "banner must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_validity_and_address() {
        let binding = Binding {
            address: String::new(),
            port: 2022,
            apply_proxy_config: false,
        };
        assert!(binding.is_valid());
        assert_eq!(binding.socket_address(), "0.0.0.0:2022");

        let invalid = Binding {
            port: 0,
            ..Binding::default()
        };
        assert!(!invalid.is_valid());

        let bound = Binding {
            address: "127.0.0.1".to_string(),
            port: 2222,
            apply_proxy_config: true,
        };
        assert_eq!(bound.socket_address(), "127.0.0.1:2222");
    }

    #[test]
    fn test_effective_max_auth_tries() {
        let mut config = Config::default();
        assert_eq!(config.effective_max_auth_tries(), 6);
        config.max_auth_tries = -1;
        assert_eq!(config.effective_max_auth_tries(), usize::MAX);
        config.max_auth_tries = 3;
        assert_eq!(config.effective_max_auth_tries(), 3);
    }

    #[test]
    fn test_default_ssh_commands() {
        let config = Config::default();
        assert_eq!(
            config.enabled_ssh_commands,
            vec!["md5sum", "sha1sum", "cd", "pwd"]
        );
    }

    #[test]
    fn test_server_id() {
        let config = Config {
            banner: "Sandpiper_test".to_string(),
            ..Default::default()
        };
        assert_eq!(config.server_id(), "SSH-2.0-Sandpiper_test");
    }

    #[test]
    fn test_validate_rejects_banner_with_spaces() {
        let config = Config {
            banner: "bad banner".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.bindings, config.bindings);
        assert_eq!(parsed.enabled_ssh_commands, config.enabled_ssh_commands);
    }
}
