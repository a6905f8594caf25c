//! User certificate validation.
//!
//! NIST 800-53: IA-2 (Identification and Authentication), AC-3 (Access Enforcement)
//! STIG: V-222611 - The application must validate certificates
//! Implementation: Trusted-CA user certificate validation with revocation checks
//!
//! Runs on every public-key attempt that carries a certificate, before
//! the user store is consulted. The checks happen in a fixed order:
//! certificate type, signing authority, principals present, revocation,
//! then the full validation (signature, validity window, principal
//! membership, critical options). Only the `source-address` critical
//! option is supported.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use russh::keys::ssh_key::certificate::CertType;
use russh::keys::ssh_key::Fingerprint;
use russh::keys::{Certificate, HashAlg, PublicKey};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::revocation::RevocationStore;

const SOURCE_ADDRESS_OPTION: &str = "source-address";

/// What a validated certificate contributes to the login.
#[derive(Debug, Clone)]
pub struct CertAuthInfo {
    /// Fingerprint of the certified public key
    pub key_fingerprint: String,
    pub key_id: String,
    pub serial: u64,
    /// Algorithm of the signing CA key
    pub ca_algorithm: String,
    pub ca_fingerprint: String,
    /// Certificate extensions, merged into the session permissions
    pub extensions: Vec<(String, String)>,
}

impl CertAuthInfo {
    /// The key description stored with the login method.
    pub fn describe(&self) -> String {
        format!(
            "{}: ID: {}, serial: {}, CA {} {}",
            self.key_fingerprint, self.key_id, self.serial, self.ca_algorithm, self.ca_fingerprint
        )
    }
}

/// User certificate checker
///
/// NIST 800-53: IA-2 (Identification and Authentication)
/// STIG: V-222611 - Certificate validation
/// Implementation: Holds the trusted user CA keys and the revocation store
pub struct CertChecker {
    trusted_cas: Vec<PublicKey>,
    trusted_fingerprints: Vec<Fingerprint>,
    revocation: Arc<RevocationStore>,
}

impl CertChecker {
    /// Load the trusted user CA keys. Each configured file holds one
    /// public key; unreadable or unparsable files are fatal.
    ///
    /// # NIST 800-53: IA-2, SI-10 (Information Input Validation)
    /// # STIG: V-222611 - Certificate validation
    /// # Implementation: Parses the CA public keys the server trusts to sign user certificates
    pub fn load(
        config_dir: &Path,
        config: &Config,
        revocation: Arc<RevocationStore>,
    ) -> Result<Self> {
        let mut trusted_cas = Vec::new();
        for raw in &config.trusted_user_ca_keys {
            let raw = raw.trim();
            if raw.is_empty() {
                warn!("ignoring empty trusted user CA key path");
                continue;
            }
            let path = if Path::new(raw).is_absolute() {
                PathBuf::from(raw)
            } else {
                config_dir.join(raw)
            };
            let key = russh::keys::load_public_key(&path).map_err(|e| {
                Error::Config(format!("error loading trusted user CA key {path:?}: {e}"))
            })?;
            info!(
                path = %path.display(),
                fingerprint = %key.fingerprint(HashAlg::Sha256),
                "trusted user CA key loaded"
            );
            trusted_cas.push(key);
        }
        let trusted_fingerprints = trusted_cas
            .iter()
            .map(|ca| ca.fingerprint(HashAlg::Sha256))
            .collect();
        Ok(Self {
            trusted_cas,
            trusted_fingerprints,
            revocation,
        })
    }

    pub fn has_trusted_cas(&self) -> bool {
        !self.trusted_cas.is_empty()
    }

    /// Whether `key` is one of the configured user certificate
    /// authorities (equality on the marshalled public key).
    ///
    /// # NIST 800-53: AC-3 (Access Enforcement), IA-2
    /// # STIG: V-222611 - Certificate validation
    /// # Implementation: Cryptographic comparison against the trusted CA set
    pub fn is_user_authority(&self, key: &russh::keys::ssh_key::public::KeyData) -> bool {
        self.trusted_cas.iter().any(|ca| ca.key_data() == key)
    }

    /// Validate a certificate presented for `username` from `remote`.
    ///
    /// # NIST 800-53: IA-2 (Identification and Authentication), AC-3 (Access Enforcement)
    /// # STIG: V-222611 - Certificate validation
    /// # Implementation: Ordered checks (type, authority, principals, revocation, validity)
    pub async fn check_user_cert(
        &self,
        username: &str,
        remote: IpAddr,
        cert: &Certificate,
    ) -> Result<CertAuthInfo> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.check_user_cert_at(username, remote, cert, now).await
    }

    pub async fn check_user_cert_at(
        &self,
        username: &str,
        remote: IpAddr,
        cert: &Certificate,
        unix_now: u64,
    ) -> Result<CertAuthInfo> {
        let fingerprint = cert.public_key().fingerprint(HashAlg::Sha256).to_string();

        if cert.cert_type() != CertType::User {
            return Err(Error::Other(format!(
                "certificate {fingerprint} has type {:?}, user certificate required",
                cert.cert_type()
            )));
        }
        if !self.is_user_authority(cert.signature_key()) {
            return Err(Error::Other(
                "certificate signed by unrecognized authority".to_string(),
            ));
        }
        if cert.valid_principals().is_empty() {
            return Err(Error::Other(format!(
                "certificate {fingerprint} has no valid principals, user: {username:?}"
            )));
        }
        if self.revocation.is_revoked(&fingerprint).await {
            return Err(Error::Other(format!(
                "certificate {fingerprint} is revoked"
            )));
        }

        cert.validate_at(unix_now, &self.trusted_fingerprints)
            .map_err(|e| Error::Other(format!("certificate {fingerprint} is not valid: {e}")))?;
        if !cert.valid_principals().iter().any(|p| p == username) {
            return Err(Error::Other(format!(
                "certificate {fingerprint} is not valid for user {username:?}"
            )));
        }
        for (name, value) in cert.critical_options().iter() {
            if name != SOURCE_ADDRESS_OPTION {
                return Err(Error::Other(format!(
                    "certificate {fingerprint} has unsupported critical option {name:?}"
                )));
            }
            if !source_address_matches(value, remote) {
                return Err(Error::Other(format!(
                    "certificate {fingerprint} is not valid from address {remote}"
                )));
            }
        }

        Ok(CertAuthInfo {
            key_fingerprint: fingerprint,
            key_id: cert.key_id().to_string(),
            serial: cert.serial(),
            ca_algorithm: cert.signature_key().algorithm().to_string(),
            ca_fingerprint: cert
                .signature_key()
                .fingerprint(HashAlg::Sha256)
                .to_string(),
            extensions: cert
                .extensions()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }
}

/// Evaluate a `source-address` option value, a comma-separated list of
/// addresses or CIDR blocks.
///
/// # NIST 800-53: AC-3 (Access Enforcement), SI-10 (Information Input Validation)
/// # STIG: V-222396 - Input validation
/// # Implementation: Unparsable entries never match
fn source_address_matches(value: &str, remote: IpAddr) -> bool {
    value.split(',').map(str::trim).any(|entry| {
        if let Ok(net) = entry.parse::<IpNet>() {
            net.contains(&remote)
        } else {
            entry.parse::<IpAddr>().map(|a| a == remote).unwrap_or(false)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;
    use russh::keys::ssh_key::certificate::Builder;
    use russh::keys::{Algorithm, PrivateKey};

    struct Fixture {
        checker: CertChecker,
        ca: PrivateKey,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let ca_path = dir.path().join("user_ca.pub");
        std::fs::write(&ca_path, ca.public_key().to_openssh().unwrap()).unwrap();

        let config = Config {
            trusted_user_ca_keys: vec!["user_ca.pub".to_string()],
            ..Default::default()
        };
        let checker =
            CertChecker::load(dir.path(), &config, Arc::new(RevocationStore::new(None))).unwrap();
        Fixture { checker, ca, dir }
    }

    fn make_cert(
        ca: &PrivateKey,
        cert_type: CertType,
        principals: &[&str],
        critical: &[(&str, &str)],
        window: (u64, u64),
    ) -> Certificate {
        let subject = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let mut builder = Builder::new_with_random_nonce(
            &mut OsRng,
            subject.public_key().key_data().clone(),
            window.0,
            window.1,
        )
        .unwrap();
        builder.cert_type(cert_type).unwrap();
        builder.key_id("test-key").unwrap();
        if principals.is_empty() {
            builder.all_principals_valid().unwrap();
        } else {
            for p in principals {
                builder.valid_principal(*p).unwrap();
            }
        }
        for (name, value) in critical {
            builder.critical_option(*name, *value).unwrap();
        }
        builder.sign(ca).unwrap()
    }

    fn remote() -> IpAddr {
        "192.168.1.5".parse().unwrap()
    }

    const NOW: u64 = 1_700_000_000;

    #[tokio::test]
    async fn test_valid_certificate() {
        let f = fixture();
        let cert = make_cert(&f.ca, CertType::User, &["alice"], &[], (0, u64::MAX));
        let info = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap();
        assert!(info.key_fingerprint.starts_with("SHA256:"));
        let description = info.describe();
        assert!(description.contains("ID: test-key"));
        assert!(description.contains("serial: 0"));
        assert!(description.contains("CA ssh-ed25519 SHA256:"));
        drop(f.dir);
    }

    #[tokio::test]
    async fn test_host_certificate_rejected() {
        let f = fixture();
        let cert = make_cert(&f.ca, CertType::Host, &["alice"], &[], (0, u64::MAX));
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("user certificate required"));
    }

    #[tokio::test]
    async fn test_unknown_authority_rejected() {
        let f = fixture();
        let rogue_ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = make_cert(&rogue_ca, CertType::User, &["alice"], &[], (0, u64::MAX));
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrecognized authority"));
    }

    #[tokio::test]
    async fn test_empty_principals_rejected() {
        let f = fixture();
        let cert = make_cert(&f.ca, CertType::User, &[], &[], (0, u64::MAX));
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no valid principals"));
    }

    #[tokio::test]
    async fn test_revoked_certificate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ca = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let cert = make_cert(&ca, CertType::User, &["alice"], &[], (0, u64::MAX));
        let fingerprint = cert.public_key().fingerprint(HashAlg::Sha256).to_string();

        std::fs::write(
            dir.path().join("user_ca.pub"),
            ca.public_key().to_openssh().unwrap(),
        )
        .unwrap();
        let revoked = dir.path().join("revoked.json");
        std::fs::write(&revoked, serde_json::to_vec(&[&fingerprint]).unwrap()).unwrap();
        let revocation = Arc::new(RevocationStore::new(Some(revoked)));
        revocation.load().await.unwrap();

        let config = Config {
            trusted_user_ca_keys: vec!["user_ca.pub".to_string()],
            ..Default::default()
        };
        let checker = CertChecker::load(dir.path(), &config, revocation).unwrap();
        let err = checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("is revoked"));
    }

    #[tokio::test]
    async fn test_expired_certificate_rejected() {
        let f = fixture();
        let cert = make_cert(&f.ca, CertType::User, &["alice"], &[], (0, NOW - 10));
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not valid"));
    }

    #[tokio::test]
    async fn test_principal_mismatch_rejected() {
        let f = fixture();
        let cert = make_cert(&f.ca, CertType::User, &["bob"], &[], (0, u64::MAX));
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not valid for user"));
    }

    #[tokio::test]
    async fn test_source_address_option() {
        let f = fixture();
        let cert = make_cert(
            &f.ca,
            CertType::User,
            &["alice"],
            &[("source-address", "192.168.1.0/24")],
            (0, u64::MAX),
        );
        assert!(f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .is_ok());

        let outside: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(f
            .checker
            .check_user_cert_at("alice", outside, &cert, NOW)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_unknown_critical_option_rejected() {
        let f = fixture();
        let cert = make_cert(
            &f.ca,
            CertType::User,
            &["alice"],
            &[("force-command", "/bin/true")],
            (0, u64::MAX),
        );
        let err = f
            .checker
            .check_user_cert_at("alice", remote(), &cert, NOW)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported critical option"));
    }

    #[test]
    fn test_source_address_matching() {
        let addr: IpAddr = "10.0.0.7".parse().unwrap();
        assert!(source_address_matches("10.0.0.0/8", addr));
        assert!(source_address_matches("192.168.0.0/16, 10.0.0.7", addr));
        assert!(!source_address_matches("192.168.0.0/16", addr));
        assert!(!source_address_matches("garbage", addr));
    }
}
