//! Algorithm negotiation policy.
//!
//! Validates the configured KEX/cipher/MAC/host-key-algorithm sets
//! against what the transport actually implements, removes duplicates
//! preserving first-seen order, and installs the result on the server.
//! When a set is left empty, a curated preferred subset is used instead.

use std::borrow::Cow;

use russh::keys::Algorithm;
use russh::Preferred;

use crate::config::Config;
use crate::error::{Error, Result};

pub const KEX_DH_GEX_SHA1: &str = "diffie-hellman-group-exchange-sha1";
pub const KEX_DH_GEX_SHA256: &str = "diffie-hellman-group-exchange-sha256";

/// Host key algorithms the transport can negotiate.
pub const SUPPORTED_HOST_KEY_ALGOS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
    "ssh-rsa",
];

pub const PREFERRED_HOST_KEY_ALGOS: &[&str] = &[
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "rsa-sha2-512",
    "rsa-sha2-256",
];

/// KEX algorithms the transport can negotiate. The DH group-exchange
/// variants are absent here: they join the supported set only when a
/// valid moduli file was loaded.
pub const SUPPORTED_KEX_ALGOS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "mlkem768x25519-sha256",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group14-sha256",
    "diffie-hellman-group16-sha512",
    "diffie-hellman-group18-sha512",
    "diffie-hellman-group14-sha1",
    "diffie-hellman-group1-sha1",
];

pub const PREFERRED_KEX_ALGOS: &[&str] = &[
    "curve25519-sha256",
    "curve25519-sha256@libssh.org",
    "ecdh-sha2-nistp256",
    "ecdh-sha2-nistp384",
    "ecdh-sha2-nistp521",
    "diffie-hellman-group14-sha256",
];

pub const SUPPORTED_CIPHERS: &[&str] = &[
    "aes128-gcm@openssh.com",
    "aes256-gcm@openssh.com",
    "chacha20-poly1305@openssh.com",
    "aes128-ctr",
    "aes192-ctr",
    "aes256-ctr",
    "aes128-cbc",
    "aes192-cbc",
    "aes256-cbc",
];

pub const PREFERRED_CIPHERS: &[&str] = &[
    "aes128-gcm@openssh.com",
    "aes256-gcm@openssh.com",
    "chacha20-poly1305@openssh.com",
    "aes128-ctr",
    "aes192-ctr",
    "aes256-ctr",
];

pub const SUPPORTED_MACS: &[&str] = &[
    "hmac-sha2-256-etm@openssh.com",
    "hmac-sha2-256",
    "hmac-sha2-512-etm@openssh.com",
    "hmac-sha2-512",
    "hmac-sha1",
    "hmac-sha1-etm@openssh.com",
];

pub const PREFERRED_MACS: &[&str] = &["hmac-sha2-256-etm@openssh.com", "hmac-sha2-256"];

/// The effective, validated algorithm sets for one server instance.
#[derive(Debug, Clone)]
pub struct AlgorithmPolicy {
    pub host_key_algos: Vec<String>,
    pub kex_algorithms: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub dh_gex_enabled: bool,
}

impl AlgorithmPolicy {
    /// Build the effective sets from the configuration.
    ///
    /// `dh_gex_enabled` reports whether a valid moduli file was loaded;
    /// without it the DH group-exchange names are stripped from a user
    /// KEX list before validation, and the SHA-1 variant is never added
    /// implicitly.
    pub fn resolve(config: &Config, dh_gex_enabled: bool) -> Result<Self> {
        let host_key_algos = if config.host_key_algorithms.is_empty() {
            to_owned(PREFERRED_HOST_KEY_ALGOS)
        } else {
            let list = dedup_preserving_order(&config.host_key_algorithms);
            validate("host key algorithm", &list, SUPPORTED_HOST_KEY_ALGOS)?;
            list
        };

        let mut supported_kex: Vec<&str> = SUPPORTED_KEX_ALGOS.to_vec();
        if dh_gex_enabled {
            supported_kex.push(KEX_DH_GEX_SHA256);
            supported_kex.push(KEX_DH_GEX_SHA1);
        }
        let kex_algorithms = if config.kex_algorithms.is_empty() {
            let mut list = to_owned(PREFERRED_KEX_ALGOS);
            if dh_gex_enabled {
                list.push(KEX_DH_GEX_SHA256.to_string());
            }
            list
        } else {
            let mut list = dedup_preserving_order(&config.kex_algorithms);
            if !dh_gex_enabled {
                list.retain(|k| k != KEX_DH_GEX_SHA1 && k != KEX_DH_GEX_SHA256);
            }
            validate("key-exchange algorithm", &list, &supported_kex)?;
            list
        };

        let ciphers = if config.ciphers.is_empty() {
            to_owned(PREFERRED_CIPHERS)
        } else {
            let list = dedup_preserving_order(&config.ciphers);
            validate("cipher", &list, SUPPORTED_CIPHERS)?;
            list
        };

        let macs = if config.macs.is_empty() {
            to_owned(PREFERRED_MACS)
        } else {
            let list = dedup_preserving_order(&config.macs);
            validate("MAC algorithm", &list, SUPPORTED_MACS)?;
            list
        };

        Ok(Self {
            host_key_algos,
            kex_algorithms,
            ciphers,
            macs,
            dh_gex_enabled,
        })
    }

    /// Install the effective sets on the transport configuration.
    pub fn apply(&self, preferred: &mut Preferred) -> Result<()> {
        let kex = self
            .kex_algorithms
            .iter()
            .map(|name| {
                russh::kex::Name::try_from(name.as_str())
                    .map_err(|_| Error::Config(format!("key-exchange algorithm {name:?} not available")))
            })
            .collect::<Result<Vec<_>>>()?;
        let key = self
            .host_key_algos
            .iter()
            .map(|name| {
                Algorithm::new(name)
                    .map_err(|_| Error::Config(format!("host key algorithm {name:?} not available")))
            })
            .collect::<Result<Vec<_>>>()?;
        let cipher = self
            .ciphers
            .iter()
            .map(|name| {
                russh::cipher::Name::try_from(name.as_str())
                    .map_err(|_| Error::Config(format!("cipher {name:?} not available")))
            })
            .collect::<Result<Vec<_>>>()?;
        let mac = self
            .macs
            .iter()
            .map(|name| {
                russh::mac::Name::try_from(name.as_str())
                    .map_err(|_| Error::Config(format!("MAC algorithm {name:?} not available")))
            })
            .collect::<Result<Vec<_>>>()?;

        preferred.kex = Cow::Owned(kex);
        preferred.key = Cow::Owned(key);
        preferred.cipher = Cow::Owned(cipher);
        preferred.mac = Cow::Owned(mac);
        Ok(())
    }
}

fn to_owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn dedup_preserving_order(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim();
        if !name.is_empty() && !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
    }
    out
}

fn validate(kind: &str, names: &[String], supported: &[&str]) -> Result<()> {
    for name in names {
        if !supported.contains(&name.as_str()) {
            return Err(Error::Config(format!("unsupported {kind} {name:?}")));
        }
    }
    Ok(())
}
